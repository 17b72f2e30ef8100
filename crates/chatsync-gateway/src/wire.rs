//! Wire shapes shared by the REST and push-channel paths.
//!
//! DTOs mirror the marketplace API serializers; unknown fields are ignored
//! so serializer additions on the server side stay compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chatsync_core::{Conversation, DeliveryState, Message, MessageId, MessageKind};

/// Message payload as the API serializes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDto {
    pub id: i64,
    pub conversation: i64,
    pub sender: i64,
    pub content: String,
    pub message_type: MessageKind,
    pub timestamp: DateTime<Utc>,
}

impl MessageDto {
    /// Convert into the cache's message type. Incoming data is durable, so
    /// the delivery state is always `Confirmed`.
    pub fn into_message(self) -> Message {
        Message {
            id: MessageId::Final(self.id),
            conversation_id: self.conversation,
            sender_id: self.sender,
            content: self.content,
            kind: self.message_type,
            timestamp_ms: self.timestamp.timestamp_millis().max(0) as u64,
            delivery: DeliveryState::Confirmed,
        }
    }
}

/// Minimal user reference embedded in conversation payloads.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UserRefDto {
    pub id: i64,
}

/// Newest-message summary embedded in conversation list payloads.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LastMessageDto {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sender_id: i64,
}

/// Conversation payload as the list endpoint serializes it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConversationDto {
    pub id: i64,
    pub other_user: UserRefDto,
    #[serde(default)]
    pub last_message: Option<LastMessageDto>,
    #[serde(default)]
    pub unread_count: u32,
}

impl ConversationDto {
    /// Convert into the cache's conversation type.
    ///
    /// The list payload summarizes the newest message without its id, so
    /// `last_message_id` stays unset until history is fetched.
    pub fn into_conversation(self, local_user_id: i64) -> Conversation {
        Conversation {
            id: self.id,
            participants: [local_user_id, self.other_user.id],
            last_message_id: None,
            last_message_time_ms: self
                .last_message
                .map(|m| m.timestamp.timestamp_millis().max(0) as u64),
            unread_count: self.unread_count,
        }
    }
}

/// Body of the durable send request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SendMessageBody<'a> {
    pub content: &'a str,
    pub message_type: MessageKind,
}

/// Body of the conversation-create request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateConversationBody {
    pub participant_id: i64,
}

/// Events the push channel delivers to this client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushInbound {
    ChatMessage {
        conversation_id: i64,
        message: MessageDto,
    },
    Typing {
        conversation_id: i64,
        user_id: i64,
        is_typing: bool,
    },
}

/// Commands this client mirrors onto the push channel.
///
/// All of these are latency optimizations for the peer's live view; the
/// durable REST write is authoritative.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushOutbound {
    SendMessage {
        conversation_id: i64,
        content: String,
        message_type: MessageKind,
    },
    Typing {
        conversation_id: i64,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_chat_message_push_frame() {
        let frame = r#"{
            "type": "chat_message",
            "conversation_id": 7,
            "message": {
                "id": 42,
                "conversation": 7,
                "sender": 2,
                "content": "hello",
                "message_type": "text",
                "timestamp": "2026-08-01T10:15:00Z",
                "is_read": false
            }
        }"#;

        let event: PushInbound = serde_json::from_str(frame).expect("frame should parse");
        match event {
            PushInbound::ChatMessage {
                conversation_id,
                message,
            } => {
                assert_eq!(conversation_id, 7);
                let message = message.into_message();
                assert_eq!(message.id, MessageId::Final(42));
                assert_eq!(message.sender_id, 2);
                assert_eq!(message.delivery, DeliveryState::Confirmed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn encodes_send_message_commands_with_snake_case_tags() {
        let command = PushOutbound::SendMessage {
            conversation_id: 7,
            content: "hi".into(),
            message_type: MessageKind::Text,
        };
        let encoded = serde_json::to_value(&command).expect("encode");
        assert_eq!(encoded["type"], "send_message");
        assert_eq!(encoded["conversation_id"], 7);
        assert_eq!(encoded["message_type"], "text");
    }

    #[test]
    fn conversation_dto_converts_with_local_participant() {
        let payload = r#"{
            "id": 3,
            "other_user": {"id": 20, "username": "founder"},
            "last_message": {
                "content": "pitch deck attached",
                "timestamp": "2026-08-01T10:15:00Z",
                "sender_id": 20
            },
            "unread_count": 2,
            "updated_at": "2026-08-01T10:16:00Z"
        }"#;

        let dto: ConversationDto = serde_json::from_str(payload).expect("payload should parse");
        let conversation = dto.into_conversation(10);

        assert_eq!(conversation.id, 3);
        assert_eq!(conversation.participants, [10, 20]);
        assert_eq!(conversation.unread_count, 2);
        assert!(conversation.last_message_time_ms.is_some());
        assert_eq!(conversation.last_message_id, None);
    }

    #[test]
    fn conversation_without_messages_has_no_last_time() {
        let payload = r#"{"id": 4, "other_user": {"id": 21}}"#;
        let dto: ConversationDto = serde_json::from_str(payload).expect("payload should parse");
        let conversation = dto.into_conversation(10);
        assert_eq!(conversation.last_message_time_ms, None);
        assert_eq!(conversation.unread_count, 0);
    }

    #[test]
    fn typing_frames_round_trip_user_state() {
        let frame = r#"{"type": "typing", "conversation_id": 7, "user_id": 2, "is_typing": true}"#;
        let event: PushInbound = serde_json::from_str(frame).expect("frame should parse");
        assert_eq!(
            event,
            PushInbound::Typing {
                conversation_id: 7,
                user_id: 2,
                is_typing: true
            }
        );
    }
}
