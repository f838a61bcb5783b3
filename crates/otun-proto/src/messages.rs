//! Control protocol message types

use serde::{Deserialize, Serialize};

/// Messages exchanged on the control channel.
///
/// Each message is a JSON object tagged by a lowercase `type` field.
/// Optional fields are omitted entirely when absent, and unknown fields
/// are ignored on decode so that either side can be upgraded first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sent by the agent to request a tunnel.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Sent by the edge to confirm tunnel registration.
    Registered { url: String, subdomain: String },
    /// Keepalive ping from the agent.
    Heartbeat,
    /// Keepalive pong from the edge.
    HeartbeatAck,
    /// Sent in either direction to report an error.
    Error { message: String },
}

impl ControlMessage {
    /// The wire tag of this message, as it appears in the `type` field.
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::Register { .. } => "register",
            ControlMessage::Registered { .. } => "registered",
            ControlMessage::Heartbeat => "heartbeat",
            ControlMessage::HeartbeatAck => "heartbeat_ack",
            ControlMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_omits_empty_fields() {
        let msg = ControlMessage::Register {
            subdomain: None,
            token: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"register"}"#);
    }

    #[test]
    fn test_register_round_trip() {
        let msg = ControlMessage::Register {
            subdomain: Some("myapp".to_string()),
            token: Some("secret".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_heartbeat_tags() {
        let json = serde_json::to_string(&ControlMessage::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat"}"#);

        let json = serde_json::to_string(&ControlMessage::HeartbeatAck).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat_ack"}"#);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let decoded: ControlMessage =
            serde_json::from_str(r#"{"type":"registered","url":"http://x.localhost","subdomain":"x","extra":42}"#)
                .unwrap();
        assert_eq!(
            decoded,
            ControlMessage::Registered {
                url: "http://x.localhost".to_string(),
                subdomain: "x".to_string(),
            }
        );
    }

    #[test]
    fn test_tag() {
        let msg = ControlMessage::Error {
            message: "boom".to_string(),
        };
        assert_eq!(msg.tag(), "error");
    }
}
