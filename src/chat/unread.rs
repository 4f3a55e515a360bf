// Unread counter reconciliation.
// Three write paths touch the counter, none individually authoritative:
// the push path increments it (roster::apply_inbound) when the conversation
// is not open, opening a conversation zeroes it optimistically, and a
// durable set-unread write confirms the zero on the server. If the durable
// write fails after the local zero there is no rollback; the next snapshot
// merge restores server truth.

use log::warn;

use crate::chat::events::{ClientEvent, MarkMessagesReadPayload};
use crate::chat::{ChatClient, ChatUpdate};

impl ChatClient {
    /// Zero the local counter and issue the read acknowledgement on both
    /// the channel and the request/response path. Redundant on purpose:
    /// either path alone may be lost.
    pub async fn acknowledge_read(&self, counterpart_id: &str) {
        let changed = {
            let mut state = self.state().lock().await;
            match state.roster.get_mut(counterpart_id) {
                Some(entry) => {
                    let had_unread = entry.unread_count != 0;
                    entry.unread_count = 0;
                    had_unread
                }
                None => {
                    warn!("Read acknowledgement for unknown conversation {}", counterpart_id);
                    return;
                }
            }
        };

        if changed {
            self.push_update(ChatUpdate::UnreadChanged {
                conversation_id: counterpart_id.to_string(),
                count: 0,
            })
            .await;
        }

        // Channel path: fire-and-forget.
        self.emit_event(ClientEvent::MarkMessagesRead(MarkMessagesReadPayload {
            counterpart_id: counterpart_id.to_string(),
        }));

        // Durable path. A failure here leaves the local zero in place.
        let session = self.session();
        if let Err(e) = session
            .api
            .set_unread_count(&session.user_id, counterpart_id, 0)
            .await
        {
            warn!("Durable unread write for {} failed: {}", counterpart_id, e);
            self.push_update(ChatUpdate::TransientError(format!(
                "Could not confirm read state: {}",
                e
            )))
            .await;
        }
    }

    /// The counterpart read our messages; surface it to the embedding
    /// application.
    pub(crate) async fn handle_messages_read(&self, reader_id: &str) {
        self.push_update(ChatUpdate::MessagesReadByCounterpart {
            counterpart_id: reader_id.to_string(),
        })
        .await;
    }
}
