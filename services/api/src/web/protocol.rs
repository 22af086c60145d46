//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser client and the
//! API server for the chat application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Joins the conversation channel of a chat the requester owns. Joining a
    /// chat that is not theirs is silently a no-op.
    JoinChat { chat_id: Uuid },

    /// Leaves a conversation channel.
    LeaveChat { chat_id: Uuid },

    /// A new user turn. `chat_type` selects the routing: "music" goes through
    /// the query-translation gate, everything else straight to the model.
    SendMessage {
        chat_id: Uuid,
        content: String,
        chat_type: String,
    },

    /// Requests cancellation of the in-flight generation for a chat. Has no
    /// effect when nothing is being generated.
    StopGeneration { chat_id: Uuid },
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Echo of a just-persisted user turn, broadcast to the whole chat room.
    NewMessage {
        id: Uuid,
        content: String,
        timestamp: DateTime<Utc>,
        is_user: bool,
    },

    /// One streamed fragment of the assistant response. Carries only the
    /// fragment, not the accumulated text.
    ResponseChunk {
        chat_id: Uuid,
        message_id: Uuid,
        chunk: String,
    },

    /// Terminal success marker for a generation; always the last event of a
    /// successful turn.
    ResponseComplete { chat_id: Uuid, message_id: Uuid },

    /// Terminal failure marker. `chat_id` is absent for failures that are not
    /// tied to a conversation (e.g. an unparseable inbound frame).
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        chat_id: Option<Uuid>,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_events_deserialize_by_wire_name() {
        let chat_id = Uuid::new_v4();
        let raw = json!({
            "type": "send_message",
            "chat_id": chat_id,
            "content": "hello",
            "chat_type": "music"
        })
        .to_string();

        let parsed: ClientMessage = serde_json::from_str(&raw).unwrap();
        match parsed {
            ClientMessage::SendMessage {
                chat_id: id,
                content,
                chat_type,
            } => {
                assert_eq!(id, chat_id);
                assert_eq!(content, "hello");
                assert_eq!(chat_type, "music");
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let raw = json!({"type": "stop_generation", "chat_id": chat_id}).to_string();
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(&raw).unwrap(),
            ClientMessage::StopGeneration { .. }
        ));
    }

    #[test]
    fn missing_fields_fail_to_parse() {
        let raw = json!({"type": "send_message", "chat_id": Uuid::new_v4()}).to_string();
        assert!(serde_json::from_str::<ClientMessage>(&raw).is_err());
    }

    #[test]
    fn outbound_events_carry_their_wire_names() {
        let chat_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();

        let chunk = ServerMessage::ResponseChunk {
            chat_id,
            message_id,
            chunk: "Hi".to_string(),
        };
        let encoded = serde_json::to_string(&chunk).unwrap();
        assert!(encoded.contains("\"type\":\"response_chunk\""));
        assert!(encoded.contains("\"chunk\":\"Hi\""));

        let complete = ServerMessage::ResponseComplete { chat_id, message_id };
        assert!(serde_json::to_string(&complete)
            .unwrap()
            .contains("\"type\":\"response_complete\""));

        let error = ServerMessage::Error {
            chat_id: None,
            error: "bad".to_string(),
        };
        let encoded = serde_json::to_string(&error).unwrap();
        assert!(encoded.contains("\"type\":\"error\""));
        assert!(!encoded.contains("chat_id"));
    }
}
