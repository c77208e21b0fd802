// Typed payloads for the voice websocket. Every inbound op becomes a
// variant of `VoiceEvent`; the session machine is a state machine over
// that enum instead of a pile of per-op callbacks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::types::{Ssrc, UserId};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VoiceGatewayMessage {
    pub op: u8,
    pub d: Value,
}

/// Op 2 Ready.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VoiceReady {
    pub ssrc: Ssrc,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

/// Op 4 Session Description.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

/// Op 5 Speaking, as sent by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerSpeaking {
    pub user_id: UserId,
    pub ssrc: Ssrc,
    pub speaking: bool,
}

#[derive(Debug)]
pub(crate) enum VoiceEvent {
    Hello { heartbeat_interval_ms: u64 },
    Ready(VoiceReady),
    SessionDescription(SessionDescription),
    Speaking(PeerSpeaking),
    HeartbeatAck,
    Resumed,
    Unknown(u8),
}

/// Snowflakes arrive as strings in most payloads and numbers in a few;
/// accept both.
pub(crate) fn parse_snowflake(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Parses one text frame from the voice websocket. Returns the
/// server-side sequence number (v8 gateways attach one for seq_ack)
/// alongside the typed event. Unknown ops are preserved for logging.
pub(crate) fn parse_voice_frame(text: &str) -> Result<(Option<i64>, VoiceEvent), serde_json::Error> {
    let message: VoiceGatewayMessage = serde_json::from_str(text)?;
    let seq = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v["seq"].as_i64());

    let event = match message.op {
        2 => VoiceEvent::Ready(serde_json::from_value(message.d)?),
        4 => VoiceEvent::SessionDescription(serde_json::from_value(message.d)?),
        5 => {
            let user_id = parse_snowflake(&message.d["user_id"]);
            let ssrc = message.d["ssrc"].as_u64().map(|s| s as Ssrc);
            match (user_id, ssrc) {
                (Some(user_id), Some(ssrc)) => VoiceEvent::Speaking(PeerSpeaking {
                    user_id,
                    ssrc,
                    speaking: message.d["speaking"].as_u64().unwrap_or(0) != 0,
                }),
                _ => VoiceEvent::Unknown(5),
            }
        }
        6 => VoiceEvent::HeartbeatAck,
        8 => VoiceEvent::Hello {
            heartbeat_interval_ms: message.d["heartbeat_interval"]
                .as_f64()
                .unwrap_or(5000.0) as u64,
        },
        9 => VoiceEvent::Resumed,
        op => VoiceEvent::Unknown(op),
    };
    Ok((seq, event))
}

pub(crate) fn identify(
    server_id: u64,
    user_id: UserId,
    session_id: &str,
    token: &str,
) -> VoiceGatewayMessage {
    VoiceGatewayMessage {
        op: 0,
        d: json!({
            "server_id": server_id.to_string(),
            "user_id": user_id.to_string(),
            "session_id": session_id,
            "token": token,
        }),
    }
}

pub(crate) fn select_protocol(address: &str, port: u16, mode: &str) -> VoiceGatewayMessage {
    VoiceGatewayMessage {
        op: 1,
        d: json!({
            "protocol": "udp",
            "data": {
                "address": address,
                "port": port,
                "mode": mode,
            },
        }),
    }
}

pub(crate) fn heartbeat(t_ms: u64, seq_ack: i64) -> VoiceGatewayMessage {
    VoiceGatewayMessage {
        op: 3,
        d: json!({ "t": t_ms, "seq_ack": seq_ack }),
    }
}

pub(crate) fn speaking(ssrc: Ssrc, is_speaking: bool) -> VoiceGatewayMessage {
    VoiceGatewayMessage {
        op: 5,
        d: json!({
            "speaking": if is_speaking { 1 } else { 0 },
            "delay": 0,
            "ssrc": ssrc,
        }),
    }
}

impl VoiceGatewayMessage {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("voice payloads are plain json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello() {
        let (_, event) =
            parse_voice_frame(r#"{"op":8,"d":{"heartbeat_interval":13750.0}}"#).unwrap();
        match event {
            VoiceEvent::Hello {
                heartbeat_interval_ms,
            } => assert_eq!(heartbeat_interval_ms, 13750),
            other => panic!("expected hello, got {:?}", other),
        }
    }

    #[test]
    fn parses_ready() {
        let (_, event) = parse_voice_frame(
            r#"{"op":2,"d":{"ssrc":12345,"ip":"203.0.113.9","port":50004,"modes":["xsalsa20_poly1305_lite","xsalsa20_poly1305"]}}"#,
        )
        .unwrap();
        match event {
            VoiceEvent::Ready(ready) => {
                assert_eq!(ready.ssrc, 12345);
                assert_eq!(ready.ip, "203.0.113.9");
                assert_eq!(ready.port, 50004);
                assert!(ready.modes.iter().any(|m| m == "xsalsa20_poly1305_lite"));
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn parses_session_description_key() {
        let key: Vec<u8> = (0u8..32).collect();
        let text = format!(
            r#"{{"op":4,"d":{{"mode":"xsalsa20_poly1305_lite","secret_key":{}}}}}"#,
            serde_json::to_string(&key).unwrap()
        );
        let (_, event) = parse_voice_frame(&text).unwrap();
        match event {
            VoiceEvent::SessionDescription(desc) => {
                assert_eq!(desc.secret_key, key);
                assert_eq!(desc.mode, "xsalsa20_poly1305_lite");
            }
            other => panic!("expected session description, got {:?}", other),
        }
    }

    #[test]
    fn parses_peer_speaking_with_string_user_id() {
        let (_, event) = parse_voice_frame(
            r#"{"op":5,"d":{"user_id":"81015939332485120","ssrc":333,"speaking":1}}"#,
        )
        .unwrap();
        match event {
            VoiceEvent::Speaking(speaking) => {
                assert_eq!(
                    speaking,
                    PeerSpeaking {
                        user_id: 81015939332485120,
                        ssrc: 333,
                        speaking: true,
                    }
                );
            }
            other => panic!("expected speaking, got {:?}", other),
        }
    }

    #[test]
    fn tracks_server_sequence_for_seq_ack() {
        let (seq, _) = parse_voice_frame(r#"{"op":6,"d":{},"seq":17}"#).unwrap();
        assert_eq!(seq, Some(17));
    }

    #[test]
    fn unknown_ops_are_preserved_not_errors() {
        let (_, event) = parse_voice_frame(r#"{"op":18,"d":{"whatever":true}}"#).unwrap();
        assert!(matches!(event, VoiceEvent::Unknown(18)));
    }

    #[test]
    fn speaking_payload_shape() {
        let message = speaking(42, true);
        assert_eq!(message.op, 5);
        assert_eq!(message.d["speaking"], 1);
        assert_eq!(message.d["delay"], 0);
        assert_eq!(message.d["ssrc"], 42);
    }

    #[test]
    fn identify_sends_ids_as_strings() {
        let message = identify(1, 2, "abc", "tok");
        assert_eq!(message.d["server_id"], "1");
        assert_eq!(message.d["user_id"], "2");
    }
}
