// Outbound message pipeline.
// Text goes over the push channel fire-and-forget; anything carrying binary
// payloads goes through the request/response path. Both insert an optimistic
// pending entry before the network call so input latency never waits on the
// network.

use log::{info, warn};
use std::path::PathBuf;

use crate::api::MediaMessageRequest;
use crate::chat::events::{ClientEvent, SendMessagePayload};
use crate::chat::{ChatClient, ChatUpdate};
use crate::error::ChatError;
use crate::models::{Attachment, MediaKind, Message, MessageContent};

/// Delay before reloading history after a successful attachment submit, to
/// pick up server-assigned media references. A timing heuristic; the server
/// sends no confirmation event for this.
pub const ATTACHMENT_RELOAD_DELAY_MS: u64 = 1000;

impl ChatClient {
    /// Send a plain text message. The optimistic entry is inserted before
    /// the channel send; no delivery acknowledgement is correlated back.
    pub async fn send_text(
        &self,
        conversation_id: &str,
        body: &str,
    ) -> Result<Message, ChatError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = Message::outbound(
            conversation_id,
            MessageContent::Text {
                body: body.to_string(),
            },
        );
        self.append_optimistic(message.clone()).await;
        self.push_update(ChatUpdate::RosterChanged).await;

        let session = self.session();
        self.emit_event(ClientEvent::SendMessage(SendMessagePayload {
            sender_id: session.user_id.clone(),
            receiver_id: conversation_id.to_string(),
            text: body.to_string(),
            client_ref: message.client_ref,
        }));
        Ok(message)
    }

    /// Send a message with attachments via the request/response path. The
    /// channel state is irrelevant here; binary payloads never travel over
    /// the push channel. On success a delayed history reload is scheduled to
    /// pick up the server-assigned media references.
    pub async fn send_with_attachments(
        &self,
        conversation_id: &str,
        body: Option<&str>,
        files: Vec<PathBuf>,
    ) -> Result<Message, ChatError> {
        let text = body
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from);
        if text.is_none() && files.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        // Media kind comes from the first file only, even for multi-file
        // sends. The attachment list still records per-file kinds.
        let media_kind = files
            .first()
            .map(|p| MediaKind::from_path(p))
            .unwrap_or(MediaKind::File);
        let attachments: Vec<Attachment> =
            files.iter().cloned().map(Attachment::from_local).collect();

        let message = Message::outbound(
            conversation_id,
            MessageContent::WithAttachments {
                body: text.clone(),
                attachments,
            },
        );
        self.append_optimistic(message.clone()).await;
        self.push_update(ChatUpdate::RosterChanged).await;

        let session = self.session();
        let request = MediaMessageRequest {
            sender_id: session.user_id.clone(),
            receiver_id: conversation_id.to_string(),
            text,
            media_kind,
            files,
            client_ref: message.client_ref,
        };

        match session.api.submit_media_message(request).await {
            Ok(()) => {
                info!("Media message accepted for {}", conversation_id);
                self.schedule_history_reload(conversation_id).await;
                Ok(message)
            }
            Err(e) => {
                // Transient notice only; the optimistic entry stays until
                // the next full reload.
                warn!("Media message submission failed: {}", e);
                self.push_update(ChatUpdate::TransientError(format!(
                    "Could not send attachments: {}",
                    e
                )))
                .await;
                Err(ChatError::request(e))
            }
        }
    }

    /// Arm (or re-arm) the cancellable delayed history reload for a
    /// conversation.
    pub(crate) async fn schedule_history_reload(&self, conversation_id: &str) {
        let client = self.clone();
        let id = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ATTACHMENT_RELOAD_DELAY_MS)).await;
            if let Err(e) = client.load_history(&id).await {
                warn!("Delayed history reload for {} failed: {}", id, e);
                client
                    .push_update(ChatUpdate::TransientError(format!(
                        "Could not refresh conversation: {}",
                        e
                    )))
                    .await;
            }
        });
        self.timers()
            .lock()
            .await
            .set_history_reload(conversation_id, handle);
    }
}
