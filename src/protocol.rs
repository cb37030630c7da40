use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::atomic::{AtomicU16, Ordering},
    time::{Duration, Instant},
};

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use log::{debug, warn};

use crate::{
    error::{Error, Result},
    uri::CoapUri,
};

#[cfg(test)]
use std::{collections::VecDeque, sync::Mutex};

pub const MAX_DATAGRAM: usize = 4096;
pub const TOKEN_LENGTH: usize = 4;

/// A datagram answering a multicast request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub source: SocketAddr,
    pub payload: Vec<u8>,
}

pub trait Protocol: Send + Sync {
    /// Confirmable GET on `uri`, waiting at most `timeout` for the response payload
    fn get(&self, uri: &CoapUri, timeout: Duration) -> Result<Vec<u8>>;

    /// Non-confirmable GET on a multicast `uri`, collecting replies for `window`
    fn multicast(&self, uri: &CoapUri, window: Duration) -> Result<Vec<Reply>>;
}

pub(crate) fn new_token() -> Vec<u8> {
    rand::random::<[u8; TOKEN_LENGTH]>().to_vec()
}

// Uri-Host and Uri-Port are left out, the datagram destination carries them
pub(crate) fn encode_get(
    uri: &CoapUri,
    kind: MessageType,
    message_id: u16,
    token: &[u8],
) -> Result<Vec<u8>> {
    let mut packet = Packet::new();
    packet.header.set_type(kind);
    packet.header.code = MessageClass::Request(RequestType::Get);
    packet.header.message_id = message_id;
    packet.set_token(token.to_vec());
    for segment in uri.path_segments() {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    for param in uri.query_params() {
        packet.add_option(CoapOption::UriQuery, param.as_bytes().to_vec());
    }
    Ok(packet.to_bytes()?)
}

pub(crate) fn encode_empty_ack(message_id: u16) -> Result<Vec<u8>> {
    let mut packet = Packet::new();
    packet.header.set_type(MessageType::Acknowledgement);
    packet.header.code = MessageClass::Empty;
    packet.header.message_id = message_id;
    Ok(packet.to_bytes()?)
}

/// What an incoming datagram means for an outstanding request
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Content(Vec<u8>),
    Failure(String),
    /// Empty ACK, the response follows separately
    Accepted,
    Unrelated,
}

pub(crate) fn classify(packet: &Packet, message_id: u16, token: &[u8]) -> Inbound {
    let acknowledges = matches!(packet.header.get_type(), MessageType::Acknowledgement)
        && packet.header.message_id == message_id;

    match &packet.header.code {
        MessageClass::Empty if acknowledges => Inbound::Accepted,
        MessageClass::Response(code) if packet.get_token().to_vec() == token => {
            if is_success(code) {
                Inbound::Content(packet.payload.clone())
            } else {
                Inbound::Failure(format!("{:?}", code))
            }
        }
        _ => Inbound::Unrelated,
    }
}

fn is_success(code: &ResponseType) -> bool {
    matches!(
        code,
        ResponseType::Content
            | ResponseType::Valid
            | ResponseType::Changed
            | ResponseType::Created
            | ResponseType::Deleted
    )
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn bind_for(peer: SocketAddr) -> io::Result<UdpSocket> {
    if peer.is_ipv4() {
        UdpSocket::bind("0.0.0.0:0")
    } else {
        UdpSocket::bind("[::]:0")
    }
}

/// CoAP over a fresh UDP socket per exchange
pub struct DefaultProtocol {
    message_id: AtomicU16,
}

impl DefaultProtocol {
    pub fn new() -> DefaultProtocol {
        DefaultProtocol {
            message_id: AtomicU16::new(rand::random()),
        }
    }

    fn next_message_id(&self) -> u16 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DefaultProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for DefaultProtocol {
    fn get(&self, uri: &CoapUri, timeout: Duration) -> Result<Vec<u8>> {
        let addr = uri.socket_addr()?;
        let socket = bind_for(addr)?;

        let message_id = self.next_message_id();
        let token = new_token();
        let req = encode_get(uri, MessageType::Confirmable, message_id, &token)?;
        socket.send_to(&req, addr)?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0_u8; MAX_DATAGRAM];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_secs(0) {
                return Err(Error::Timeout(timeout));
            }
            socket.set_read_timeout(Some(remaining))?;

            let (size, source) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(ref err) if is_timeout(err) => return Err(Error::Timeout(timeout)),
                Err(err) => return Err(err.into()),
            };
            let packet = match Packet::from_bytes(&buf[0..size]) {
                Ok(packet) => packet,
                Err(err) => {
                    debug!("Ignoring undecodable datagram from {}: {:?}", source, err);
                    continue;
                }
            };

            match classify(&packet, message_id, &token) {
                Inbound::Content(payload) => {
                    if matches!(packet.header.get_type(), MessageType::Confirmable) {
                        socket.send_to(&encode_empty_ack(packet.header.message_id)?, source)?;
                    }
                    return Ok(payload);
                }
                Inbound::Failure(code) => return Err(Error::Status(code)),
                Inbound::Accepted => debug!("{} accepted request, waiting for response", uri),
                Inbound::Unrelated => debug!("Ignoring unrelated message from {}", source),
            }
        }
    }

    fn multicast(&self, uri: &CoapUri, window: Duration) -> Result<Vec<Reply>> {
        let group = uri.socket_addr()?;
        let socket = bind_for(group)?;

        let message_id = self.next_message_id();
        let token = new_token();
        let req = encode_get(uri, MessageType::NonConfirmable, message_id, &token)?;
        socket.send_to(&req, group)?;

        let deadline = Instant::now() + window;
        Ok(collect_replies(deadline, message_id, &token, |buf, remaining| {
            socket.set_read_timeout(Some(remaining))?;
            socket.recv_from(buf)
        }))
    }
}

/// Gather matching responses until `deadline`; a failed receive ends the
/// window but keeps what already arrived
fn collect_replies<R>(deadline: Instant, message_id: u16, token: &[u8], mut recv: R) -> Vec<Reply>
where
    R: FnMut(&mut [u8], Duration) -> io::Result<(usize, SocketAddr)>,
{
    let mut buf = [0_u8; MAX_DATAGRAM];
    let mut replies = vec![];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::from_secs(0) {
            break;
        }

        let (size, source) = match recv(&mut buf, remaining) {
            Ok(received) => received,
            Err(ref err) if is_timeout(err) => break,
            Err(err) => {
                warn!("Stopped listening for discovery replies: {}", err);
                break;
            }
        };
        match Packet::from_bytes(&buf[0..size]) {
            Ok(packet) => match classify(&packet, message_id, token) {
                Inbound::Content(payload) => replies.push(Reply { source, payload }),
                Inbound::Failure(code) => debug!("{} answered discovery with {}", source, code),
                _ => debug!("Ignoring unrelated message from {}", source),
            },
            Err(err) => debug!("Ignoring undecodable datagram from {}: {:?}", source, err),
        }
    }

    replies
}

/// Scripted stand-in for the network
#[cfg(test)]
pub struct ProtocolMock {
    gets: Mutex<VecDeque<Result<Vec<u8>>>>,
    multicasts: Mutex<VecDeque<Result<Vec<Reply>>>>,
    requests: Mutex<Vec<String>>,
}

#[cfg(test)]
impl ProtocolMock {
    pub fn new() -> ProtocolMock {
        ProtocolMock {
            gets: Mutex::new(VecDeque::new()),
            multicasts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn push_get(&self, resp: Result<Vec<u8>>) {
        self.gets.lock().unwrap().push_back(resp);
    }

    pub fn push_multicast(&self, resp: Result<Vec<Reply>>) {
        self.multicasts.lock().unwrap().push_back(resp);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Protocol for ProtocolMock {
    fn get(&self, uri: &CoapUri, timeout: Duration) -> Result<Vec<u8>> {
        self.requests.lock().unwrap().push(uri.to_string());
        self.gets
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(Error::Timeout(timeout)))
    }

    fn multicast(&self, uri: &CoapUri, _window: Duration) -> Result<Vec<Reply>> {
        self.requests.lock().unwrap().push(uri.to_string());
        self.multicasts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::tests::{DISCOVERY_JSON, LIGHT_JSON};
    use std::thread;

    fn option_strings(packet: &Packet, option: CoapOption) -> Vec<String> {
        packet
            .get_option(option)
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8(v.clone()).unwrap())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn response(request: &Packet, kind: MessageType, message_id: u16, payload: &str) -> Vec<u8> {
        let mut packet = Packet::new();
        packet.header.set_type(kind);
        packet.header.code = MessageClass::Response(ResponseType::Content);
        packet.header.message_id = message_id;
        packet.set_token(request.get_token().to_vec());
        packet.payload = payload.as_bytes().to_vec();
        packet.to_bytes().unwrap()
    }

    fn device() -> (UdpSocket, CoapUri) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let uri = CoapUri::from_source(addr, "/a/light");
        (socket, uri)
    }

    #[test]
    fn encode_discovery_request() {
        let uri: CoapUri = "coap://224.0.1.187:5683/oic/res?rt=core.light".parse().unwrap();
        let bytes = encode_get(&uri, MessageType::NonConfirmable, 7, &[1, 2, 3, 4]).unwrap();
        let packet = Packet::from_bytes(&bytes).unwrap();

        assert!(matches!(packet.header.get_type(), MessageType::NonConfirmable));
        assert!(matches!(packet.header.code, MessageClass::Request(RequestType::Get)));
        assert_eq!(7, packet.header.message_id);
        assert_eq!(vec![1, 2, 3, 4], packet.get_token().to_vec());
        assert_eq!(vec!["oic", "res"], option_strings(&packet, CoapOption::UriPath));
        assert_eq!(vec!["rt=core.light"], option_strings(&packet, CoapOption::UriQuery));
        assert!(packet.get_option(CoapOption::UriPort).is_none());
        assert!(packet.get_option(CoapOption::UriHost).is_none());
    }

    #[test]
    fn classify_ignores_foreign_tokens() {
        let uri: CoapUri = "coap://127.0.0.1/a/light".parse().unwrap();
        let request = Packet::from_bytes(
            &encode_get(&uri, MessageType::Confirmable, 1, &[9, 9, 9, 9]).unwrap(),
        )
        .unwrap();
        let reply =
            Packet::from_bytes(&response(&request, MessageType::Acknowledgement, 1, "{}")).unwrap();

        assert_eq!(Inbound::Content(b"{}".to_vec()), classify(&reply, 1, &[9, 9, 9, 9]));
        assert_eq!(Inbound::Unrelated, classify(&reply, 1, &[1, 1, 1, 1]));

        let ack = Packet::from_bytes(&encode_empty_ack(1).unwrap()).unwrap();
        assert_eq!(Inbound::Accepted, classify(&ack, 1, &[9, 9, 9, 9]));
        assert_eq!(Inbound::Unrelated, classify(&ack, 2, &[9, 9, 9, 9]));
    }

    #[test]
    fn get_piggybacked_response() {
        let (server, uri) = device();

        let handle = thread::spawn(move || {
            let mut buf = [0_u8; MAX_DATAGRAM];
            let (size, peer) = server.recv_from(&mut buf).unwrap();
            let request = Packet::from_bytes(&buf[0..size]).unwrap();
            assert!(matches!(request.header.get_type(), MessageType::Confirmable));
            assert_eq!(vec!["a", "light"], option_strings(&request, CoapOption::UriPath));
            let reply = response(
                &request,
                MessageType::Acknowledgement,
                request.header.message_id,
                LIGHT_JSON,
            );
            server.send_to(&reply, peer).unwrap();
        });

        let payload = DefaultProtocol::new()
            .get(&uri, Duration::from_millis(1000))
            .unwrap();
        handle.join().unwrap();

        assert_eq!(LIGHT_JSON.as_bytes(), payload.as_slice());
    }

    #[test]
    fn get_separate_response() {
        let (server, uri) = device();

        let handle = thread::spawn(move || {
            let mut buf = [0_u8; MAX_DATAGRAM];
            let (size, peer) = server.recv_from(&mut buf).unwrap();
            let request = Packet::from_bytes(&buf[0..size]).unwrap();
            server
                .send_to(&encode_empty_ack(request.header.message_id).unwrap(), peer)
                .unwrap();
            let reply = response(&request, MessageType::Confirmable, 4242, LIGHT_JSON);
            server.send_to(&reply, peer).unwrap();

            let (size, _) = server.recv_from(&mut buf).unwrap();
            let ack = Packet::from_bytes(&buf[0..size]).unwrap();
            assert!(matches!(ack.header.get_type(), MessageType::Acknowledgement));
            assert_eq!(4242, ack.header.message_id);
        });

        let payload = DefaultProtocol::new()
            .get(&uri, Duration::from_millis(1000))
            .unwrap();
        handle.join().unwrap();

        assert_eq!(LIGHT_JSON.as_bytes(), payload.as_slice());
    }

    #[test]
    fn get_error_response() {
        let (server, uri) = device();

        let handle = thread::spawn(move || {
            let mut buf = [0_u8; MAX_DATAGRAM];
            let (size, peer) = server.recv_from(&mut buf).unwrap();
            let request = Packet::from_bytes(&buf[0..size]).unwrap();
            let mut packet = Packet::new();
            packet.header.set_type(MessageType::Acknowledgement);
            packet.header.code = MessageClass::Response(ResponseType::NotFound);
            packet.header.message_id = request.header.message_id;
            packet.set_token(request.get_token().to_vec());
            server.send_to(&packet.to_bytes().unwrap(), peer).unwrap();
        });

        let result = DefaultProtocol::new().get(&uri, Duration::from_millis(1000));
        handle.join().unwrap();

        assert!(matches!(result, Err(Error::Status(_))));
    }

    #[test]
    fn get_times_out() {
        let (_server, uri) = device();

        let started = Instant::now();
        let result = DefaultProtocol::new().get(&uri, Duration::from_millis(1000));
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    }

    #[test]
    fn multicast_collects_replies_for_window() {
        let (server, _) = device();
        let uri = CoapUri::from_source(server.local_addr().unwrap(), "/oic/res?rt=core.light");

        let handle = thread::spawn(move || {
            let mut buf = [0_u8; MAX_DATAGRAM];
            let (size, peer) = server.recv_from(&mut buf).unwrap();
            let request = Packet::from_bytes(&buf[0..size]).unwrap();
            assert!(matches!(request.header.get_type(), MessageType::NonConfirmable));
            assert_eq!(vec!["rt=core.light"], option_strings(&request, CoapOption::UriQuery));
            for message_id in 1..=2 {
                let reply = response(&request, MessageType::NonConfirmable, message_id, DISCOVERY_JSON);
                server.send_to(&reply, peer).unwrap();
            }
            server.send_to(b"garbage", peer).unwrap();
        });

        let replies = DefaultProtocol::new()
            .multicast(&uri, Duration::from_millis(300))
            .unwrap();
        handle.join().unwrap();

        assert_eq!(2, replies.len());
        assert!(replies.iter().all(|r| r.payload == DISCOVERY_JSON.as_bytes()));
    }

    #[test]
    fn multicast_keeps_replies_after_receive_failure() {
        let uri: CoapUri = "coap://224.0.1.187/oic/res?rt=core.light".parse().unwrap();
        let token = [5, 6, 7, 8];
        let request =
            Packet::from_bytes(&encode_get(&uri, MessageType::NonConfirmable, 3, &token).unwrap())
                .unwrap();
        let source: SocketAddr = "203.0.113.5:5683".parse().unwrap();

        let mut datagrams: VecDeque<io::Result<Vec<u8>>> = VecDeque::new();
        datagrams.push_back(Ok(response(&request, MessageType::NonConfirmable, 11, DISCOVERY_JSON)));
        datagrams.push_back(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        datagrams.push_back(Ok(response(&request, MessageType::NonConfirmable, 12, DISCOVERY_JSON)));

        let deadline = Instant::now() + Duration::from_secs(5);
        let replies = collect_replies(deadline, 3, &token, |buf, _| {
            let datagram = datagrams.pop_front().unwrap()?;
            buf[..datagram.len()].copy_from_slice(&datagram);
            Ok((datagram.len(), source))
        });

        assert_eq!(
            vec![Reply {
                source,
                payload: DISCOVERY_JSON.as_bytes().to_vec()
            }],
            replies
        );
        assert_eq!(1, datagrams.len());
    }
}
