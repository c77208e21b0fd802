// The main Discord gateway connection: identify, heartbeat, and the
// two dispatches a voice join needs (VOICE_STATE_UPDATE and
// VOICE_SERVER_UPDATE, in either order). Also relays the usernames it
// sees so transcripts can carry display names.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::model::types::{ChannelId, GuildId, UserId};
use crate::voice::payload::parse_snowflake;
use crate::voice::session::ConnectionInfo;

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// GUILDS | GUILD_VOICE_STATES
const GATEWAY_INTENTS: u64 = (1 << 0) | (1 << 7);

const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub(crate) enum GatewayError {
    #[error("gateway websocket error: {0}")]
    Websocket(String),
    #[error("gateway connection ended before READY")]
    NoReady,
}

/// Things the control context needs to hear about.
#[derive(Debug)]
pub(crate) enum GatewayNotice {
    /// Reconnect/invalid-session/close: any active voice session must
    /// be torn down before we re-identify.
    VoiceSessionInvalidated,
    /// A username we observed in a voice state, for the roster.
    UserSeen { user_id: UserId, display_name: String },
}

enum GatewayCommand {
    JoinChannel {
        guild_id: GuildId,
        channel_id: ChannelId,
        reply: oneshot::Sender<ConnectionInfo>,
    },
    /// Voice-state update with a null channel, used both for leaving
    /// and for rolling back a failed join.
    ClearVoiceState { guild_id: GuildId },
}

/// One pending JoinChannel, filled in as its two dispatches arrive.
struct PendingJoin {
    guild_id: GuildId,
    channel_id: ChannelId,
    reply: oneshot::Sender<ConnectionInfo>,
    session_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
}

pub(crate) struct GatewayHandle {
    tx_cmd: UnboundedSender<GatewayCommand>,
    user_id: Arc<std::sync::atomic::AtomicU64>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// Our user id from READY; None until the gateway authenticated.
    pub fn user_id(&self) -> Option<UserId> {
        match self.user_id.load(std::sync::atomic::Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    /// Submits the voice-state update for a join and returns a receiver
    /// that fires once both voice dispatches arrived. The caller owns
    /// the 15s timeout and the rollback on failure.
    pub fn request_join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Option<oneshot::Receiver<ConnectionInfo>> {
        let (reply, rx) = oneshot::channel();
        self.tx_cmd
            .send(GatewayCommand::JoinChannel {
                guild_id,
                channel_id,
                reply,
            })
            .ok()?;
        Some(rx)
    }

    /// Sets our voice channel to null in the given guild.
    pub fn clear_voice_state(&self, guild_id: GuildId) {
        let _ = self.tx_cmd.send(GatewayCommand::ClearVoiceState { guild_id });
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Connects and identifies, resolving once READY arrives. The
/// connection then keeps itself alive (heartbeats, reconnect with
/// re-identify) until the handle is shut down.
pub(crate) async fn connect(
    bot_token: String,
    tx_notice: UnboundedSender<GatewayNotice>,
) -> Result<GatewayHandle, GatewayError> {
    connect_url(GATEWAY_URL.to_string(), bot_token, tx_notice).await
}

pub(crate) async fn connect_url(
    url: String,
    bot_token: String,
    tx_notice: UnboundedSender<GatewayNotice>,
) -> Result<GatewayHandle, GatewayError> {
    let (tx_cmd, rx_cmd) = unbounded_channel();
    let user_id = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let (tx_ready, rx_ready) = oneshot::channel();

    let task = tokio::spawn(run(
        url,
        bot_token,
        rx_cmd,
        tx_notice,
        user_id.clone(),
        tx_ready,
    ));

    match rx_ready.await {
        Ok(()) => Ok(GatewayHandle {
            tx_cmd,
            user_id,
            task,
        }),
        Err(_) => {
            task.abort();
            Err(GatewayError::NoReady)
        }
    }
}

/// Outer reconnect loop. Each inner session failure invalidates any
/// active voice session and re-identifies from scratch.
async fn run(
    url: String,
    bot_token: String,
    mut rx_cmd: UnboundedReceiver<GatewayCommand>,
    tx_notice: UnboundedSender<GatewayNotice>,
    user_id: Arc<std::sync::atomic::AtomicU64>,
    tx_ready: oneshot::Sender<()>,
) {
    let mut tx_ready = Some(tx_ready);
    let mut attempt = 0u32;
    loop {
        match run_session(
            &url,
            &bot_token,
            &mut rx_cmd,
            &tx_notice,
            &user_id,
            &mut tx_ready,
        )
        .await
        {
            Ok(()) => {
                // command channel closed: the client is going away
                return;
            }
            Err(e) => {
                let _ = tx_notice.send(GatewayNotice::VoiceSessionInvalidated);
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    warn!("gateway: giving up after {} reconnect attempts", attempt - 1);
                    return;
                }
                let backoff =
                    std::time::Duration::from_millis(1000 * 2u64.pow((attempt - 1).min(3)));
                warn!(
                    "gateway session error ({}); reconnecting in {:?} (attempt {}/{})",
                    e, backoff, attempt, MAX_RECONNECT_ATTEMPTS
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn run_session(
    url: &str,
    bot_token: &str,
    rx_cmd: &mut UnboundedReceiver<GatewayCommand>,
    tx_notice: &UnboundedSender<GatewayNotice>,
    user_id: &Arc<std::sync::atomic::AtomicU64>,
    tx_ready: &mut Option<oneshot::Sender<()>>,
) -> Result<(), GatewayError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| GatewayError::Websocket(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    let (tx_ws, mut rx_ws) = unbounded_channel::<Message>();
    let write_task = tokio::spawn(async move {
        while let Some(message) = rx_ws.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut last_seq: Option<i64> = None;
    let mut heartbeat_task: Option<JoinHandle<()>> = None;
    let heartbeat_token = CancellationToken::new();
    let mut pending_join: Option<PendingJoin> = None;
    // guild -> our session id, remembered across joins in that guild
    let mut voice_session_ids: HashMap<GuildId, String> = HashMap::new();

    let result = loop {
        let frame = tokio::select! {
            command = rx_cmd.recv() => {
                match command {
                    Some(command) => {
                        handle_command(command, &tx_ws, &mut pending_join);
                        continue;
                    }
                    None => break Ok(()),
                }
            }
            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                break Err(GatewayError::Websocket(format!("closed: {:?}", frame)));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(GatewayError::Websocket(e.to_string())),
            None => break Err(GatewayError::Websocket("stream ended".to_string())),
        };

        let message: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!("unparseable gateway frame: {}", e);
                continue;
            }
        };
        if let Some(seq) = message["s"].as_i64() {
            last_seq = Some(seq);
        }

        match message["op"].as_u64() {
            // Hello: start heartbeating, then identify
            Some(10) => {
                let interval_ms = message["d"]["heartbeat_interval"].as_f64().unwrap_or(41_250.0);
                if let Some(task) = heartbeat_task.take() {
                    task.abort();
                }
                heartbeat_task = Some(spawn_gateway_heartbeat(
                    tx_ws.clone(),
                    std::time::Duration::from_millis(interval_ms as u64),
                    heartbeat_token.clone(),
                ));
                let identify = json!({
                    "op": 2,
                    "d": {
                        "token": bot_token,
                        "intents": GATEWAY_INTENTS,
                        "properties": {
                            "os": std::env::consts::OS,
                            "browser": "discanto",
                            "device": "discanto",
                        },
                    },
                });
                let _ = tx_ws.send(Message::Text(identify.to_string()));
            }
            // Heartbeat ack
            Some(11) => trace!("gateway heartbeat ack"),
            // Server asks for an immediate heartbeat
            Some(1) => {
                let _ = tx_ws.send(Message::Text(
                    json!({ "op": 1, "d": last_seq }).to_string(),
                ));
            }
            // Reconnect / invalid session
            Some(7) | Some(9) => {
                info!("gateway requested reconnect/invalid session");
                break Err(GatewayError::Websocket("reconnect requested".to_string()));
            }
            // Dispatch
            Some(0) => handle_dispatch(
                &message,
                user_id,
                tx_ready,
                tx_notice,
                &mut pending_join,
                &mut voice_session_ids,
            ),
            Some(op) => trace!("ignoring gateway op {}", op),
            None => {}
        }
    };

    heartbeat_token.cancel();
    if let Some(task) = heartbeat_task {
        task.abort();
    }
    drop(tx_ws);
    let _ = write_task.await;
    result
}

fn handle_command(
    command: GatewayCommand,
    tx_ws: &UnboundedSender<Message>,
    pending_join: &mut Option<PendingJoin>,
) {
    match command {
        GatewayCommand::JoinChannel {
            guild_id,
            channel_id,
            reply,
        } => {
            // subscribe to the guild, then ask to join the channel
            let subscribe = json!({
                "op": 14,
                "d": {
                    "guild_id": guild_id.to_string(),
                    "channels": { channel_id.to_string(): [] },
                },
            });
            let voice_state = json!({
                "op": 4,
                "d": {
                    "guild_id": guild_id.to_string(),
                    "channel_id": channel_id.to_string(),
                    "self_mute": false,
                    "self_deaf": false,
                    "self_video": false,
                },
            });
            let _ = tx_ws.send(Message::Text(subscribe.to_string()));
            let _ = tx_ws.send(Message::Text(voice_state.to_string()));
            *pending_join = Some(PendingJoin {
                guild_id,
                channel_id,
                reply,
                session_id: None,
                endpoint: None,
                token: None,
            });
        }
        GatewayCommand::ClearVoiceState { guild_id } => {
            let voice_state = json!({
                "op": 4,
                "d": {
                    "guild_id": guild_id.to_string(),
                    "channel_id": Value::Null,
                    "self_mute": false,
                    "self_deaf": false,
                    "self_video": false,
                },
            });
            let _ = tx_ws.send(Message::Text(voice_state.to_string()));
        }
    }
}

fn handle_dispatch(
    message: &Value,
    user_id: &Arc<std::sync::atomic::AtomicU64>,
    tx_ready: &mut Option<oneshot::Sender<()>>,
    tx_notice: &UnboundedSender<GatewayNotice>,
    pending_join: &mut Option<PendingJoin>,
    voice_session_ids: &mut HashMap<GuildId, String>,
) {
    let d = &message["d"];
    match message["t"].as_str() {
        Some("READY") => {
            if let Some(id) = parse_snowflake(&d["user"]["id"]) {
                user_id.store(id, std::sync::atomic::Ordering::Relaxed);
                info!("gateway ready as user {}", id);
            }
            if let Some(tx) = tx_ready.take() {
                let _ = tx.send(());
            }
        }
        Some("VOICE_STATE_UPDATE") => {
            let state_user = parse_snowflake(&d["user_id"]);
            let guild_id = parse_snowflake(&d["guild_id"]);

            // usernames ride along on voice states; remember them all
            if let (Some(seen_id), Some(name)) = (
                state_user,
                d["member"]["user"]["global_name"]
                    .as_str()
                    .or_else(|| d["member"]["user"]["username"].as_str()),
            ) {
                let _ = tx_notice.send(GatewayNotice::UserSeen {
                    user_id: seen_id,
                    display_name: name.to_string(),
                });
            }

            let ours = state_user == Some(user_id.load(std::sync::atomic::Ordering::Relaxed));
            if !ours {
                return;
            }
            if let (Some(guild_id), Some(session_id)) = (guild_id, d["session_id"].as_str()) {
                voice_session_ids.insert(guild_id, session_id.to_string());
                if let Some(pending) = pending_join.as_mut() {
                    if pending.guild_id == guild_id {
                        pending.session_id = Some(session_id.to_string());
                    }
                }
                try_complete_join(pending_join, user_id);
            }
        }
        Some("VOICE_SERVER_UPDATE") => {
            let guild_id = parse_snowflake(&d["guild_id"]);
            let endpoint = d["endpoint"].as_str();
            let token = d["token"].as_str();
            if let (Some(guild_id), Some(endpoint), Some(token)) = (guild_id, endpoint, token) {
                if let Some(pending) = pending_join.as_mut() {
                    if pending.guild_id == guild_id {
                        pending.endpoint = Some(endpoint.to_string());
                        pending.token = Some(token.to_string());
                        // a session id from an earlier join in this
                        // guild still counts
                        if pending.session_id.is_none() {
                            pending.session_id = voice_session_ids.get(&guild_id).cloned();
                        }
                    }
                }
                try_complete_join(pending_join, user_id);
            }
        }
        Some(other) => trace!("ignoring dispatch {}", other),
        None => {}
    }
}

/// Both dispatches are required before the voice websocket can open;
/// order between them is not guaranteed.
fn try_complete_join(
    pending_join: &mut Option<PendingJoin>,
    user_id: &Arc<std::sync::atomic::AtomicU64>,
) {
    let complete = matches!(
        pending_join,
        Some(PendingJoin {
            session_id: Some(_),
            endpoint: Some(_),
            token: Some(_),
            ..
        })
    );
    if !complete {
        return;
    }
    let pending = pending_join.take().expect("checked above");
    debug!(
        "voice join parameters complete for guild {}",
        pending.guild_id
    );
    let _ = pending.reply.send(ConnectionInfo {
        guild_id: pending.guild_id,
        channel_id: pending.channel_id,
        user_id: user_id.load(std::sync::atomic::Ordering::Relaxed),
        session_id: pending.session_id.expect("checked"),
        endpoint: pending.endpoint.expect("checked"),
        token: pending.token.expect("checked"),
    });
}

fn spawn_gateway_heartbeat(
    tx_ws: UnboundedSender<Message>,
    interval: std::time::Duration,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => return,
                _ = ticker.tick() => {
                    let t = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis())
                        .unwrap_or(0);
                    trace!("gateway heartbeat at {}", t);
                    if tx_ws.send(Message::Text(json!({ "op": 1, "d": Value::Null }).to_string())).is_err() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    // Mock main gateway: hello, expects identify, sends READY, then for
    // a join sends the two voice dispatches in the awkward order
    // (server update first).
    async fn mock_gateway(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        ws.send(Message::Text(
            json!({ "op": 10, "d": { "heartbeat_interval": 41250.0 } }).to_string(),
        ))
        .await
        .unwrap();

        let identify = ws.next().await.unwrap().unwrap();
        let identify: Value = serde_json::from_str(identify.to_text().unwrap()).unwrap();
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "bot-token");

        ws.send(Message::Text(
            json!({
                "op": 0, "s": 1, "t": "READY",
                "d": { "user": { "id": "3030" }, "session_id": "gw-sess" },
            })
            .to_string(),
        ))
        .await
        .unwrap();

        // guild subscribe + voice state update
        let subscribe = ws.next().await.unwrap().unwrap();
        let subscribe: Value = serde_json::from_str(subscribe.to_text().unwrap()).unwrap();
        assert_eq!(subscribe["op"], 14);
        let voice_state = ws.next().await.unwrap().unwrap();
        let voice_state: Value = serde_json::from_str(voice_state.to_text().unwrap()).unwrap();
        assert_eq!(voice_state["op"], 4);
        assert_eq!(voice_state["d"]["guild_id"], "77");
        assert_eq!(voice_state["d"]["channel_id"], "88");
        assert_eq!(voice_state["d"]["self_deaf"], false);

        // VOICE_SERVER_UPDATE arrives before VOICE_STATE_UPDATE
        ws.send(Message::Text(
            json!({
                "op": 0, "s": 2, "t": "VOICE_SERVER_UPDATE",
                "d": {
                    "guild_id": "77",
                    "endpoint": "voice.example.com:443",
                    "token": "voice-token",
                },
            })
            .to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(
            json!({
                "op": 0, "s": 3, "t": "VOICE_STATE_UPDATE",
                "d": {
                    "guild_id": "77",
                    "channel_id": "88",
                    "user_id": "3030",
                    "session_id": "voice-sess",
                    "member": { "user": { "username": "ourbot", "global_name": null } },
                },
            })
            .to_string(),
        ))
        .await
        .unwrap();

        while let Some(Ok(_)) = ws.next().await {}
    }

    #[tokio::test]
    async fn join_completes_with_dispatches_in_either_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(mock_gateway(listener));

        let (tx_notice, mut rx_notice) = unbounded_channel();
        let handle = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            connect_url(
                format!("ws://{}", addr),
                "bot-token".to_string(),
                tx_notice,
            ),
        )
        .await
        .expect("connect finishes")
        .expect("connect succeeds");

        assert_eq!(handle.user_id(), Some(3030));

        let rx = handle.request_join(77, 88).expect("command accepted");
        let info = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .expect("join completes")
            .expect("reply sent");
        assert_eq!(info.guild_id, 77);
        assert_eq!(info.channel_id, 88);
        assert_eq!(info.user_id, 3030);
        assert_eq!(info.session_id, "voice-sess");
        assert_eq!(info.endpoint, "voice.example.com:443");
        assert_eq!(info.token, "voice-token");

        // our own voice state carried a username for the roster
        let notice = tokio::time::timeout(std::time::Duration::from_secs(2), rx_notice.recv())
            .await
            .unwrap()
            .unwrap();
        match notice {
            GatewayNotice::UserSeen {
                user_id,
                display_name,
            } => {
                assert_eq!(user_id, 3030);
                assert_eq!(display_name, "ourbot");
            }
            other => panic!("expected UserSeen, got {:?}", other),
        }

        handle.shutdown();
        server.abort();
    }
}
