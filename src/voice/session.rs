// The voice websocket lifecycle: Identify, Hello/heartbeat, Ready, IP
// discovery, Select Protocol, Session Description, then the long-lived
// Active loop. Each inbound op is a typed `VoiceEvent`; the handshake
// is a state machine over that enum rather than a set of callbacks.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::events::audio::{DecodedAudio, SpeakerBindingUpdate};
use crate::model::constants::{
    CIPHER_MODE, MAX_MISSED_HEARTBEATS, VOICE_GATEWAY_VERSION, VOICE_HEARTBEAT_INTERVAL,
};
use crate::model::types::{ChannelId, GuildId, Ssrc, UserId};
use crate::voice::crypto::{PacketCrypto, SECRET_KEY_SIZE};
use crate::voice::payload::{self, VoiceEvent};
use crate::voice::recv::spawn_receive_loop;
use crate::voice::udp;

/// Everything the gateway bridge gathered for one voice connection.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionInfo {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub session_id: String,
    pub endpoint: String,
    pub token: String,
}

#[derive(Debug, Error)]
pub(crate) enum VoiceConnectionError {
    #[error("voice websocket error: {0}")]
    Websocket(String),
    #[error("voice server closed the connection during the handshake")]
    HandshakeClosed,
    #[error("voice server offered none of our cipher modes")]
    UnsupportedMode,
    #[error("voice protocol violation: {0}")]
    Protocol(String),
    #[error("udp setup failed: {0}")]
    Io(#[from] io::Error),
    #[error("opus codec init failed: {0}")]
    Codec(#[from] audiopus::Error),
}

/// Handles held by the control context once the session is Active.
/// Cancelling the shutdown token stops every task; dropping `tx_ws`
/// afterwards lets the write task exit and the websocket close.
pub(crate) struct VoiceSession {
    pub ssrc: Ssrc,
    pub socket: Arc<UdpSocket>,
    pub crypto: Arc<PacketCrypto>,
    pub tx_ws: UnboundedSender<Message>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl VoiceSession {
    /// Sends op 5 to raise or clear our speaking flag.
    pub fn set_speaking(&self, speaking: bool) {
        let _ = self.tx_ws.send(Message::Text(
            payload::speaking(self.ssrc, speaking).to_text(),
        ));
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Runs the full voice handshake and spawns the session tasks:
/// websocket event loop, heartbeat, UDP receive loop, UDP keepalive.
/// Returns once op 4 sealed the session key (the Active state); callers
/// wrap this in the join timeout.
pub(crate) async fn connect(
    info: &ConnectionInfo,
    tx_bindings: UnboundedSender<SpeakerBindingUpdate>,
    tx_audio: UnboundedSender<DecodedAudio>,
    dropped_packets: Arc<AtomicU64>,
    shutdown_token: CancellationToken,
) -> Result<VoiceSession, VoiceConnectionError> {
    let endpoint = info.endpoint.trim_end_matches(":80");
    let url = format!("wss://{}/?v={}", endpoint, VOICE_GATEWAY_VERSION);
    connect_url(&url, info, tx_bindings, tx_audio, dropped_packets, shutdown_token).await
}

async fn connect_url(
    url: &str,
    info: &ConnectionInfo,
    tx_bindings: UnboundedSender<SpeakerBindingUpdate>,
    tx_audio: UnboundedSender<DecodedAudio>,
    dropped_packets: Arc<AtomicU64>,
    shutdown_token: CancellationToken,
) -> Result<VoiceSession, VoiceConnectionError> {
    debug!("connecting voice websocket: {}", url);
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| VoiceConnectionError::Websocket(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    // write task: everything outbound funnels through one channel
    let (tx_ws, mut rx_ws) = unbounded_channel::<Message>();
    let write_task = tokio::spawn(async move {
        while let Some(message) = rx_ws.recv().await {
            if let Err(e) = write.send(message).await {
                debug!("voice websocket write ended: {}", e);
                break;
            }
        }
    });

    tx_ws
        .send(Message::Text(
            payload::identify(info.guild_id, info.user_id, &info.session_id, &info.token)
                .to_text(),
        ))
        .map_err(|_| VoiceConnectionError::Websocket("write task gone".to_string()))?;

    let seq_ack = Arc::new(AtomicI64::new(-1));
    let outstanding_heartbeats = Arc::new(AtomicU32::new(0));
    let mut heartbeat_task: Option<JoinHandle<()>> = None;

    // handshake: Identifying -> Discovering -> Selecting -> Active
    let mut ready: Option<payload::VoiceReady> = None;
    let mut socket: Option<Arc<UdpSocket>> = None;
    let session_key = loop {
        let frame = match read.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(VoiceConnectionError::Websocket(e.to_string())),
            None => return Err(VoiceConnectionError::HandshakeClosed),
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return Err(VoiceConnectionError::HandshakeClosed),
            _ => continue,
        };
        let (seq, event) = payload::parse_voice_frame(&text)
            .map_err(|e| VoiceConnectionError::Protocol(e.to_string()))?;
        if let Some(seq) = seq {
            seq_ack.store(seq, Ordering::Relaxed);
        }

        match event {
            VoiceEvent::Hello {
                heartbeat_interval_ms,
            } => {
                debug!("voice hello, server interval {}ms", heartbeat_interval_ms);
                heartbeat_task = Some(spawn_heartbeat(
                    tx_ws.clone(),
                    seq_ack.clone(),
                    outstanding_heartbeats.clone(),
                    heartbeat_interval_ms,
                    shutdown_token.clone(),
                ));
            }
            VoiceEvent::Ready(r) => {
                if !r.modes.iter().any(|mode| mode == CIPHER_MODE) {
                    return Err(VoiceConnectionError::UnsupportedMode);
                }
                let server: SocketAddr = format!("{}:{}", r.ip, r.port)
                    .parse()
                    .map_err(|e| VoiceConnectionError::Protocol(format!("bad server addr: {e}")))?;
                let udp_socket = udp::bind_and_connect(server).await?;
                let (external_ip, external_port) =
                    udp::discover_external_address(&udp_socket, r.ssrc).await?;
                tx_ws
                    .send(Message::Text(
                        payload::select_protocol(&external_ip, external_port, CIPHER_MODE)
                            .to_text(),
                    ))
                    .map_err(|_| {
                        VoiceConnectionError::Websocket("write task gone".to_string())
                    })?;
                socket = Some(Arc::new(udp_socket));
                ready = Some(r);
            }
            VoiceEvent::SessionDescription(desc) => {
                if desc.mode != CIPHER_MODE {
                    return Err(VoiceConnectionError::Protocol(format!(
                        "server selected unexpected mode {}",
                        desc.mode
                    )));
                }
                let key: [u8; SECRET_KEY_SIZE] =
                    desc.secret_key.as_slice().try_into().map_err(|_| {
                        VoiceConnectionError::Protocol(format!(
                            "secret key has {} bytes, expected {}",
                            desc.secret_key.len(),
                            SECRET_KEY_SIZE
                        ))
                    })?;
                break key;
            }
            VoiceEvent::Speaking(_) => {
                // speaking updates are only processed once Active
            }
            other => trace!("ignoring {:?} during handshake", other),
        }
    };

    let ready = ready.ok_or_else(|| {
        VoiceConnectionError::Protocol("session description before ready".to_string())
    })?;
    let socket = socket.expect("socket exists whenever ready does");
    let crypto = Arc::new(PacketCrypto::new(&session_key));

    info!(
        "voice session active: guild {} channel {} ssrc {}",
        info.guild_id, info.channel_id, ready.ssrc
    );

    let mut tasks = vec![write_task];
    if let Some(task) = heartbeat_task {
        tasks.push(task);
    }
    tasks.push(spawn_receive_loop(
        socket.clone(),
        crypto.clone(),
        tx_audio,
        dropped_packets,
        shutdown_token.clone(),
    )?);
    tasks.push(udp::spawn_keepalive(
        socket.clone(),
        ready.ssrc,
        shutdown_token.clone(),
    ));
    tasks.push(spawn_event_loop(
        read,
        tx_bindings,
        seq_ack,
        outstanding_heartbeats,
        shutdown_token,
    ));

    Ok(VoiceSession {
        ssrc: ready.ssrc,
        socket,
        crypto,
        tx_ws,
        tasks,
    })
}

/// Heartbeats carry a monotonically increasing timestamp and the last
/// observed server sequence. Two unacknowledged intervals in a row are
/// fatal for the session.
fn spawn_heartbeat(
    tx_ws: UnboundedSender<Message>,
    seq_ack: Arc<AtomicI64>,
    outstanding: Arc<AtomicU32>,
    server_interval_ms: u64,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    let interval = VOICE_HEARTBEAT_INTERVAL.min(std::time::Duration::from_millis(
        server_interval_ms.max(1),
    ));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; take it here so the loop
        // below sends on a steady cadence
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => return,
                _ = ticker.tick() => {
                    if outstanding.load(Ordering::Relaxed) >= MAX_MISSED_HEARTBEATS {
                        warn!(
                            "voice heartbeat missed {} acks; closing session",
                            MAX_MISSED_HEARTBEATS
                        );
                        shutdown_token.cancel();
                        return;
                    }
                    let message =
                        payload::heartbeat(now_unix_ms(), seq_ack.load(Ordering::Relaxed));
                    outstanding.fetch_add(1, Ordering::Relaxed);
                    if tx_ws.send(Message::Text(message.to_text())).is_err() {
                        return;
                    }
                }
            }
        }
    })
}

/// The Active-state websocket loop: speaking updates feed the SSRC
/// binding channel, acks feed liveness, unknown ops are logged and
/// ignored. A close or read error is protocol-fatal and cancels the
/// whole session.
fn spawn_event_loop(
    mut read: impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
    tx_bindings: UnboundedSender<SpeakerBindingUpdate>,
    seq_ack: Arc<AtomicI64>,
    outstanding_heartbeats: Arc<AtomicU32>,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = shutdown_token.cancelled() => return,
                frame = read.next() => frame,
            };
            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    warn!("voice websocket closed: {:?}", frame);
                    shutdown_token.cancel();
                    return;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("voice websocket read error: {}", e);
                    shutdown_token.cancel();
                    return;
                }
                None => {
                    warn!("voice websocket stream ended");
                    shutdown_token.cancel();
                    return;
                }
            };

            let (seq, event) = match payload::parse_voice_frame(&text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("unparseable voice frame: {}", e);
                    continue;
                }
            };
            if let Some(seq) = seq {
                seq_ack.store(seq, Ordering::Relaxed);
            }

            match event {
                VoiceEvent::Speaking(speaking) => {
                    trace!(
                        "speaking update: user {} ssrc {} speaking {}",
                        speaking.user_id,
                        speaking.ssrc,
                        speaking.speaking
                    );
                    if tx_bindings
                        .send(SpeakerBindingUpdate {
                            ssrc: speaking.ssrc,
                            user_id: speaking.user_id,
                            speaking: speaking.speaking,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                VoiceEvent::HeartbeatAck => {
                    outstanding_heartbeats.store(0, Ordering::Relaxed);
                }
                VoiceEvent::Resumed => debug!("voice session resumed"),
                VoiceEvent::Unknown(op) => trace!("ignoring voice op {}", op),
                other => trace!("ignoring {:?} while active", other),
            }
        }
    })
}
