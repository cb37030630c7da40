//! Read a light's power asynchronously
use std::{net::SocketAddr, time::Duration};

use ::tokio::{net::UdpSocket, time::timeout as tokio_timeout};
use coap_lite::{MessageType, Packet};
use log::{debug, warn};

use crate::{
    datatypes::{parse_power, PowerReading},
    error::{Error, Result},
    protocol::{classify, encode_empty_ack, encode_get, new_token, Inbound, MAX_DATAGRAM},
    uri::CoapUri,
};

/// Confirmable GET on `uri`, giving up after `timeout`
pub async fn get(uri: &CoapUri, timeout: Duration) -> Result<Vec<u8>> {
    let addr = uri.socket_addr()?;
    let socket = UdpSocket::bind(if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?;

    let message_id = rand::random::<u16>();
    let token = new_token();
    let req = encode_get(uri, MessageType::Confirmable, message_id, &token)?;
    socket.send_to(&req, addr).await?;

    match tokio_timeout(timeout, exchange(&socket, message_id, &token)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

async fn exchange(socket: &UdpSocket, message_id: u16, token: &[u8]) -> Result<Vec<u8>> {
    let mut buf = [0_u8; MAX_DATAGRAM];
    loop {
        let (size, source): (usize, SocketAddr) = socket.recv_from(&mut buf).await?;
        let packet = match Packet::from_bytes(&buf[0..size]) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("Ignoring undecodable datagram from {}: {:?}", source, err);
                continue;
            }
        };
        match classify(&packet, message_id, token) {
            Inbound::Content(payload) => {
                if matches!(packet.header.get_type(), MessageType::Confirmable) {
                    let ack = encode_empty_ack(packet.header.message_id)?;
                    socket.send_to(&ack, source).await?;
                }
                return Ok(payload);
            }
            Inbound::Failure(code) => return Err(Error::Status(code)),
            Inbound::Accepted | Inbound::Unrelated => {}
        }
    }
}

/// One poll of the power resource at `uri`
pub async fn read_power(uri: &CoapUri, timeout: Duration) -> PowerReading {
    let result = match get(uri, timeout).await {
        Ok(payload) => parse_power(&payload),
        Err(err) => Err(err),
    };
    if let Err(err) = &result {
        warn!("Could not read power of {}: {}", uri, err);
    }
    PowerReading::from(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::tests::LIGHT_JSON;
    use coap_lite::{MessageClass, ResponseType};

    #[tokio::test]
    async fn reads_power() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let uri = CoapUri::from_source(server.local_addr().unwrap(), "/a/light");

        let device = tokio::spawn(async move {
            let mut buf = [0_u8; MAX_DATAGRAM];
            let (size, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = Packet::from_bytes(&buf[0..size]).unwrap();
            let mut reply = Packet::new();
            reply.header.set_type(MessageType::Acknowledgement);
            reply.header.code = MessageClass::Response(ResponseType::Content);
            reply.header.message_id = request.header.message_id;
            reply.set_token(request.get_token().to_vec());
            reply.payload = LIGHT_JSON.as_bytes().to_vec();
            server.send_to(&reply.to_bytes().unwrap(), peer).await.unwrap();
        });

        let reading = read_power(&uri, Duration::from_millis(1000)).await;
        device.await.unwrap();

        assert_eq!(PowerReading::Decimal(42.5), reading);
    }

    #[tokio::test]
    async fn silent_device_is_undefined() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let uri = CoapUri::from_source(server.local_addr().unwrap(), "/a/light");

        let started = std::time::Instant::now();
        let reading = read_power(&uri, Duration::from_millis(200)).await;

        assert_eq!(PowerReading::Undefined, reading);
        assert!(started.elapsed() < Duration::from_millis(1000));
    }
}
