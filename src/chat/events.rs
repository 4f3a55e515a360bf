// Push channel wire protocol.
// Frames are JSON text of the form {"event": "...", "data": {...}}; event
// names are kebab-case. Delivery is at-most-once, ordered on the channel
// only, so decoding failures are logged and dropped rather than retried.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Attachment, DeliveryState, Direction, MediaKind, Message, MessageContent,
};

/// Events the server pushes to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ConnectionEstablished,
    NewMessage(NewMessagePayload),
    Typing(TypingPayload),
    MessagesRead(MessagesReadPayload),
}

/// Events the client emits over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Authenticate(AuthenticatePayload),
    SendMessage(SendMessagePayload),
    Typing(OutboundTypingPayload),
    MarkMessagesRead(MarkMessagesReadPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_refs: Vec<String>,
    #[serde(default)]
    pub media_kind: Option<MediaKind>,
    #[serde(default)]
    pub client_ref: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl NewMessagePayload {
    /// Build the inbound message this event describes. The conversation is
    /// keyed by the counterpart, i.e. the sender.
    pub fn to_message(&self, message_id: &str) -> Message {
        let content = if self.media_refs.is_empty() {
            MessageContent::Text {
                body: self.text.clone().unwrap_or_default(),
            }
        } else {
            let kind = self.media_kind.unwrap_or(MediaKind::File);
            MessageContent::WithAttachments {
                body: self.text.clone().filter(|t| !t.is_empty()),
                attachments: self
                    .media_refs
                    .iter()
                    .map(|r| Attachment::from_remote(kind, r.clone()))
                    .collect(),
            }
        };
        Message {
            id: message_id.to_string(),
            conversation_id: self.sender_id.clone(),
            direction: Direction::Inbound,
            content,
            created_at: self.created_at,
            delivery_state: DeliveryState::Confirmed,
            client_ref: self.client_ref,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub sender_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesReadPayload {
    pub reader_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    #[serde(default)]
    pub client_ref: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundTypingPayload {
    pub receiver_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkMessagesReadPayload {
    pub counterpart_id: String,
}

pub fn encode_client_event(event: &ClientEvent) -> Result<String> {
    serde_json::to_string(event).context("Failed to encode client event")
}

pub fn decode_server_event(frame: &str) -> Result<ServerEvent> {
    serde_json::from_str(frame).context("Failed to decode server event")
}
