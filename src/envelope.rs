//! Wire envelopes
//!
//! JSON messages exchanged with the browser client, discriminated by a
//! `type` field.
//!
//! ## Client envelopes
//! - `subscribe`: join a channel's delivery set
//! - `unsubscribe`: leave a channel's delivery set
//! - `message`: send a chat message to a channel
//! - `presence_request`: ask for the current online user list
//!
//! ## Server envelopes
//! - `message` / `message_edit`: a canonical persisted message
//! - `message_delete`: a message was removed
//! - `presence_update`: a user went online or offline
//! - `presence_list`: snapshot of online users
//! - `error`: a request-scoped failure, sent to one connection only

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hub::{ChannelId, UserId};
use crate::store::ChatMessage;

/// Client-to-server envelopes
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Subscribe {
        channel_id: ChannelId,
    },
    Unsubscribe {
        channel_id: ChannelId,
    },
    Message {
        channel_id: ChannelId,
        #[serde(default)]
        content: String,
    },
    PresenceRequest,
}

/// User presence status carried by `presence_update`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Server-to-client envelopes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Message {
        message: ChatMessage,
    },
    MessageEdit {
        message: ChatMessage,
    },
    MessageDelete {
        channel_id: ChannelId,
        message_id: Uuid,
    },
    PresenceUpdate {
        user_id: UserId,
        status: PresenceStatus,
    },
    PresenceList {
        user_ids: Vec<UserId>,
    },
    Error {
        message: String,
    },
}

/// Parse a client envelope from a raw text frame
pub fn parse(data: &str) -> Result<ClientEnvelope, EnvelopeError> {
    serde_json::from_str(data).map_err(EnvelopeError::Parse)
}

/// Encode a server envelope to its wire form
pub fn encode(envelope: &ServerEnvelope) -> String {
    serde_json::to_string(envelope).unwrap()
}

/// Envelope decode errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to parse envelope: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    #[test]
    fn test_parse_subscribe() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"type":"subscribe","channel_id":"{id}"}}"#);
        match parse(&json).unwrap() {
            ClientEnvelope::Subscribe { channel_id } => assert_eq!(channel_id, id),
            other => panic!("expected Subscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unsubscribe() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"type":"unsubscribe","channel_id":"{id}"}}"#);
        match parse(&json).unwrap() {
            ClientEnvelope::Unsubscribe { channel_id } => assert_eq!(channel_id, id),
            other => panic!("expected Unsubscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_message() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"type":"message","channel_id":"{id}","content":"hi"}}"#);
        match parse(&json).unwrap() {
            ClientEnvelope::Message {
                channel_id,
                content,
            } => {
                assert_eq!(channel_id, id);
                assert_eq!(content, "hi");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_message_missing_content_defaults_empty() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"type":"message","channel_id":"{id}"}}"#);
        match parse(&json).unwrap() {
            ClientEnvelope::Message { content, .. } => assert!(content.is_empty()),
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_presence_request() {
        let parsed = parse(r#"{"type":"presence_request"}"#).unwrap();
        assert!(matches!(parsed, ClientEnvelope::PresenceRequest));
    }

    #[test]
    fn test_parse_unknown_kind_is_error() {
        assert!(parse(r#"{"type":"teleport","channel_id":"x"}"#).is_err());
        assert!(parse("not json at all").is_err());
    }

    fn sample_message() -> ChatMessage {
        let now = Utc::now();
        ChatMessage {
            id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            content: "hello".to_string(),
            edited: false,
            created_at: now,
            updated_at: now,
            author_username: Some("marissa".to_string()),
        }
    }

    #[test]
    fn test_encode_message() {
        let message = sample_message();
        let encoded = encode(&ServerEnvelope::Message {
            message: message.clone(),
        });
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["message"]["content"], "hello");
        assert_eq!(json["message"]["id"], message.id.to_string());
        assert_eq!(json["message"]["author_username"], "marissa");
    }

    #[test]
    fn test_encode_message_delete() {
        let channel_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let encoded = encode(&ServerEnvelope::MessageDelete {
            channel_id,
            message_id,
        });
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["type"], "message_delete");
        assert_eq!(json["channel_id"], channel_id.to_string());
        assert_eq!(json["message_id"], message_id.to_string());
    }

    #[test]
    fn test_encode_presence_update() {
        let user_id = Uuid::new_v4();
        let encoded = encode(&ServerEnvelope::PresenceUpdate {
            user_id,
            status: PresenceStatus::Online,
        });
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["type"], "presence_update");
        assert_eq!(json["user_id"], user_id.to_string());
        assert_eq!(json["status"], "online");

        let encoded = encode(&ServerEnvelope::PresenceUpdate {
            user_id,
            status: PresenceStatus::Offline,
        });
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["status"], "offline");
    }

    #[test]
    fn test_encode_presence_list() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let encoded = encode(&ServerEnvelope::PresenceList {
            user_ids: ids.clone(),
        });
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["type"], "presence_list");
        assert_eq!(json["user_ids"][0], ids[0].to_string());
        assert_eq!(json["user_ids"][1], ids[1].to_string());
    }

    #[test]
    fn test_encode_error() {
        let encoded = encode(&ServerEnvelope::Error {
            message: "not a member of this channel".to_string(),
        });
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "not a member of this channel");
    }
}
