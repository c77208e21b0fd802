// UDP transport for the voice session: one connected socket, an IP
// discovery exchange performed exactly once, and a periodic keepalive
// so NAT mappings survive receive-only stretches.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::model::constants::{IP_DISCOVERY_TIMEOUT, UDP_KEEPALIVE_GAP};
use crate::model::types::Ssrc;

/// Discovery datagrams are 74 bytes in both directions.
pub(crate) const DISCOVERY_PACKET_LEN: usize = 74;

/// Type field shared by request and response.
const DISCOVERY_TYPE: [u8; 2] = [0x00, 0x01];

/// Value of the length field: the 70 bytes following it.
const DISCOVERY_LENGTH_FIELD: u16 = 70;

/// Builds the 74-byte discovery request: type, length, SSRC, zeros.
pub(crate) fn discovery_request(ssrc: Ssrc) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[0..2].copy_from_slice(&DISCOVERY_TYPE);
    packet[2..4].copy_from_slice(&DISCOVERY_LENGTH_FIELD.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// True for datagrams that belong to the discovery exchange. These must
/// never be fed to the audio path, and conveniently can't be confused
/// with RTP: their first byte encodes version 0.
pub(crate) fn is_discovery_datagram(buf: &[u8]) -> bool {
    buf.len() >= DISCOVERY_PACKET_LEN && buf[0..2] == DISCOVERY_TYPE
}

/// Extracts our external address from a discovery response: a
/// NUL-terminated ASCII address at byte 8, and a big-endian port in the
/// final two bytes.
pub(crate) fn parse_discovery_response(buf: &[u8]) -> Option<(String, u16)> {
    if !is_discovery_datagram(buf) {
        return None;
    }
    let address_field = &buf[8..DISCOVERY_PACKET_LEN - 2];
    let nul = address_field.iter().position(|b| *b == 0)?;
    let address = std::str::from_utf8(&address_field[..nul]).ok()?.to_string();
    if address.is_empty() {
        return None;
    }
    let port = u16::from_be_bytes([buf[DISCOVERY_PACKET_LEN - 2], buf[DISCOVERY_PACKET_LEN - 1]]);
    Some((address, port))
}

/// Binds an ephemeral local port and connects the socket to the voice
/// server, so sends don't re-specify the address and receives are
/// filtered to that peer by the OS.
pub(crate) async fn bind_and_connect(server: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;
    debug!("voice UDP socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Runs IP discovery: send the request, consume the first matching
/// response, hand anything else back to the floor. Returns the external
/// (address, port) the server sees, for Select Protocol.
pub(crate) async fn discover_external_address(
    socket: &UdpSocket,
    ssrc: Ssrc,
) -> io::Result<(String, u16)> {
    socket.send(&discovery_request(ssrc)).await?;

    let mut buf = [0u8; 1536];
    let deadline = tokio::time::Instant::now() + IP_DISCOVERY_TIMEOUT;
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "no IP discovery response")
            })??;
        if let Some((address, port)) = parse_discovery_response(&buf[..received]) {
            debug!("discovered external address {}:{}", address, port);
            return Ok((address, port));
        }
        trace!("ignoring {}-byte datagram during IP discovery", received);
    }
}

/// Sends a small keepalive datagram every 5 seconds until cancelled.
pub(crate) fn spawn_keepalive(
    socket: Arc<UdpSocket>,
    ssrc: Ssrc,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UDP_KEEPALIVE_GAP);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(e) = socket.send(&ssrc.to_be_bytes()).await {
                        warn!("UDP keepalive send failed: {}", e);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let packet = discovery_request(0x01020304);
        assert_eq!(packet.len(), 74);
        assert_eq!(&packet[0..2], &[0x00, 0x01]);
        assert_eq!(&packet[2..4], &[0x00, 70]);
        assert_eq!(&packet[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert!(packet[8..].iter().all(|b| *b == 0));
    }

    fn response_with(address: &str, port: u16) -> [u8; DISCOVERY_PACKET_LEN] {
        let mut packet = discovery_request(77);
        packet[8..8 + address.len()].copy_from_slice(address.as_bytes());
        packet[DISCOVERY_PACKET_LEN - 2..].copy_from_slice(&port.to_be_bytes());
        packet
    }

    #[test]
    fn parses_response_address_and_port() {
        let packet = response_with("203.0.113.9", 50004);
        assert_eq!(
            parse_discovery_response(&packet),
            Some(("203.0.113.9".to_string(), 50004))
        );
    }

    #[test]
    fn rejects_short_and_non_discovery_datagrams() {
        assert!(parse_discovery_response(&[0u8; 73]).is_none());
        let mut rtp_like = response_with("203.0.113.9", 1);
        rtp_like[0] = 0x80;
        assert!(parse_discovery_response(&rtp_like).is_none());
        assert!(!is_discovery_datagram(&rtp_like));
    }

    #[test]
    fn discovery_request_is_recognized_as_discovery() {
        // both directions share the type field, so our own request
        // pattern must also be kept away from the audio path
        assert!(is_discovery_datagram(&discovery_request(1)));
    }

    #[test]
    fn empty_address_is_rejected() {
        let mut packet = discovery_request(77);
        packet[DISCOVERY_PACKET_LEN - 2..].copy_from_slice(&1u16.to_be_bytes());
        assert!(parse_discovery_response(&packet).is_none());
    }

    #[tokio::test]
    async fn discovery_over_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = bind_and_connect(server_addr).await.unwrap();

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, DISCOVERY_PACKET_LEN);
            let reply = response_with("198.51.100.7", 41234);
            server.send_to(&reply, from).await.unwrap();
        });

        let (address, port) = discover_external_address(&client, 77).await.unwrap();
        assert_eq!(address, "198.51.100.7");
        assert_eq!(port, 41234);
        server_task.await.unwrap();
    }
}
