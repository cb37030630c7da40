//! Discover lights on the local network asynchronously
//!
use std::{convert::TryFrom, time::Duration};

use ::tokio::{
    net::UdpSocket,
    time::{timeout_at, Instant},
};
use coap_lite::{MessageType, Packet};
use log::{debug, warn};

use crate::{
    config::DiscoveryConfig,
    datatypes::DeviceRecord,
    error::Result,
    protocol::{classify, encode_get, new_token, Inbound, MAX_DATAGRAM},
};

/// Discover lights described by `config`, listening for its window
pub async fn with_config(config: &DiscoveryConfig) -> Result<Vec<DeviceRecord>> {
    let target = config.target();
    let group = target.socket_addr()?;
    let socket = UdpSocket::bind(if group.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?;

    let message_id = rand::random::<u16>();
    let token = new_token();
    let req = encode_get(&target, MessageType::NonConfirmable, message_id, &token)?;
    socket.send_to(&req, group).await?;

    let deadline = Instant::now() + config.window();
    let mut buf = [0_u8; MAX_DATAGRAM];

    let mut devices: Vec<DeviceRecord> = vec![];
    while let Ok(Ok((size, addr))) = timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let packet = match Packet::from_bytes(&buf[0..size]) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("Ignoring undecodable datagram from {}: {:?}", addr, err);
                continue;
            }
        };
        if let Inbound::Content(payload) = classify(&packet, message_id, &token) {
            match DeviceRecord::from_reply(addr, &payload) {
                Ok(record) if devices.contains(&record) => {}
                Ok(record) => devices.push(record),
                Err(err) => warn!("Dropping discovery reply from {}: {}", addr, err),
            }
        }
    }

    Ok(devices)
}

fn window_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Discover IoTivity lights on the local network
pub async fn with_timeout(timeout: Duration) -> Result<Vec<DeviceRecord>> {
    let config = DiscoveryConfig {
        window_ms: window_millis(timeout),
        ..Default::default()
    };
    with_config(&config).await
}

/// Discover IoTivity lights on the local network
///
/// Uses the default listen window of 3 seconds.
pub async fn discover() -> Result<Vec<DeviceRecord>> {
    with_config(&DiscoveryConfig::default()).await
}
