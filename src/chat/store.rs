// Conversation store: per-conversation ordered message logs.
// Logs are ascending in created-at with no duplicate ids. History loads
// replace a log wholesale (the server is authoritative for history), with
// locally-pending optimistic messages deduplicated by their client ref
// echo, falling back to timestamp+body equality, and re-appended still
// pending when unmatched.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::chat::{ChatClient, ChatUpdate};
use crate::models::{DeliveryState, Direction, Message};

/// Window for the timestamp+body fallback match between a pending local
/// message and a server record that lacks a client ref.
const DEDUP_WINDOW_MS: i64 = 5000;

/// Insert keeping ascending created-at order; equal timestamps keep
/// submission order. Returns false when a message with the same id is
/// already present.
pub fn insert_sorted(log: &mut Vec<Message>, message: Message) -> bool {
    if log.iter().any(|m| m.id == message.id) {
        debug!("Dropping duplicate message id {}", message.id);
        return false;
    }
    let pos = log.partition_point(|m| m.created_at <= message.created_at);
    log.insert(pos, message);
    true
}

/// Latest entry's preview text and timestamp, for roster recompute.
pub fn latest_preview(log: &[Message]) -> Option<(String, DateTime<Utc>)> {
    log.last().map(|m| (m.content.preview(), m.created_at))
}

fn matches_pending(pending: &Message, server: &Message) -> bool {
    if let (Some(local_ref), Some(server_ref)) = (pending.client_ref, server.client_ref) {
        return local_ref == server_ref;
    }
    // Fallback heuristic for servers that do not echo the ref.
    server.direction == Direction::Outbound
        && pending.content.body_text() == server.content.body_text()
        && (pending.created_at - server.created_at).num_milliseconds().abs() <= DEDUP_WINDOW_MS
}

/// Replace a local log with server history. Pending locals confirmed by the
/// server are dropped in favor of the authoritative record; unmatched
/// pendings are re-appended, still pending.
pub fn reconcile_history(local: Option<Vec<Message>>, server: Vec<Message>) -> Vec<Message> {
    let mut log: Vec<Message> = Vec::with_capacity(server.len());
    for message in server {
        insert_sorted(&mut log, message);
    }

    if let Some(previous) = local {
        for pending in previous
            .into_iter()
            .filter(|m| m.delivery_state == DeliveryState::Pending)
        {
            if log.iter().any(|srv| matches_pending(&pending, srv)) {
                debug!("Pending message {} confirmed by history reload", pending.id);
                continue;
            }
            insert_sorted(&mut log, pending);
        }
    }
    log
}

impl ChatClient {
    /// Replace the local message log for a conversation with full server
    /// history and recompute the preview. If the conversation is currently
    /// open this also fires the mark-read side effect on both the channel
    /// and the request/response path.
    pub async fn load_history(&self, counterpart_id: &str) -> Result<()> {
        let fetch_started = Utc::now();
        let user_id = self.session().user_id.clone();
        let records = self
            .session()
            .api
            .fetch_history(&user_id, counterpart_id)
            .await?;
        let messages: Vec<Message> = records
            .into_iter()
            .map(|r| r.into_message(&user_id))
            .collect();

        let mark_read = {
            let mut state = self.state().lock().await;
            let open = state.open_conversation.as_deref() == Some(counterpart_id);
            let Some(entry) = state.roster.get_mut(counterpart_id) else {
                warn!("History loaded for {} but it is not in the roster", counterpart_id);
                return Ok(());
            };
            let log = reconcile_history(entry.messages.take(), messages);
            if fetch_started >= entry.preview_updated_at {
                if let Some((preview, at)) = latest_preview(&log) {
                    entry.last_preview = Some(preview);
                    entry.last_activity = at;
                    entry.preview_updated_at = fetch_started;
                }
            } else {
                debug!(
                    "History fetch for {} lost the preview race to a newer push",
                    counterpart_id
                );
            }
            entry.messages = Some(log);
            open
        };

        self.push_update(ChatUpdate::HistoryLoaded {
            conversation_id: counterpart_id.to_string(),
        })
        .await;

        if mark_read {
            // Redundant on purpose: either path alone can be lost.
            self.acknowledge_read(counterpart_id).await;
        }
        Ok(())
    }

    /// Insert a sender-authored message before any network confirmation,
    /// keeping input latency independent of network latency.
    pub(crate) async fn append_optimistic(&self, message: Message) {
        let preview = message.content.preview();
        let now = Utc::now();
        let mut state = self.state().lock().await;
        let conversation_id = message.conversation_id.clone();
        if let Some(entry) = state.roster.get_mut(&conversation_id) {
            match entry.messages.as_mut() {
                Some(log) => {
                    insert_sorted(log, message);
                }
                None => entry.messages = Some(vec![message]),
            }
        } else {
            warn!("Optimistic append for unknown conversation {}", conversation_id);
            return;
        }
        state.roster.apply_sent(&conversation_id, &preview, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageContent;
    use chrono::Duration;
    use uuid::Uuid;

    fn text_message(id: &str, body: &str, at: DateTime<Utc>, direction: Direction) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "bob".to_string(),
            direction,
            content: MessageContent::Text { body: body.to_string() },
            created_at: at,
            delivery_state: DeliveryState::Confirmed,
            client_ref: None,
        }
    }

    fn pending(id: &str, body: &str, at: DateTime<Utc>, client_ref: Option<Uuid>) -> Message {
        Message {
            delivery_state: DeliveryState::Pending,
            client_ref,
            ..text_message(id, body, at, Direction::Outbound)
        }
    }

    fn assert_monotonic(log: &[Message]) {
        for pair in log.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at, "log out of order");
        }
    }

    #[test]
    fn test_insert_sorted_keeps_ascending_order() {
        let now = Utc::now();
        let mut log = Vec::new();
        insert_sorted(&mut log, text_message("m2", "two", now, Direction::Inbound));
        insert_sorted(
            &mut log,
            text_message("m1", "one", now - Duration::seconds(10), Direction::Inbound),
        );
        insert_sorted(
            &mut log,
            text_message("m3", "three", now + Duration::seconds(10), Direction::Inbound),
        );
        assert_monotonic(&log);
        assert_eq!(log[0].id, "m1");
        assert_eq!(log[2].id, "m3");
    }

    #[test]
    fn test_insert_sorted_rejects_duplicate_id() {
        let now = Utc::now();
        let mut log = Vec::new();
        assert!(insert_sorted(&mut log, text_message("m1", "one", now, Direction::Inbound)));
        assert!(!insert_sorted(&mut log, text_message("m1", "copy", now, Direction::Inbound)));
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].content.body_text(), Some("one"));
    }

    #[test]
    fn test_equal_timestamps_keep_submission_order() {
        let now = Utc::now();
        let mut log = Vec::new();
        insert_sorted(&mut log, text_message("m1", "first", now, Direction::Outbound));
        insert_sorted(&mut log, text_message("m2", "second", now, Direction::Outbound));
        assert_eq!(log[0].id, "m1");
        assert_eq!(log[1].id, "m2");
    }

    #[test]
    fn test_reconcile_confirms_pending_by_client_ref() {
        let now = Utc::now();
        let client_ref = Uuid::new_v4();
        let local = vec![pending("local-1", "hello", now, Some(client_ref))];

        let mut server_msg = text_message("srv-1", "hello", now, Direction::Outbound);
        server_msg.client_ref = Some(client_ref);

        let log = reconcile_history(Some(local), vec![server_msg]);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, "srv-1");
        assert_eq!(log[0].delivery_state, DeliveryState::Confirmed);
    }

    #[test]
    fn test_reconcile_falls_back_to_timestamp_and_body() {
        let now = Utc::now();
        let local = vec![pending("local-1", "hello", now, Some(Uuid::new_v4()))];
        // Server record without a ref echo, two seconds off.
        let server_msg = text_message("srv-1", "hello", now - Duration::seconds(2), Direction::Outbound);
        let log = reconcile_history(Some(local), vec![server_msg]);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, "srv-1");
    }

    #[test]
    fn test_reconcile_keeps_unmatched_pending() {
        let now = Utc::now();
        let local = vec![pending("local-1", "not yet stored", now, Some(Uuid::new_v4()))];
        let server_msg = text_message("srv-1", "older talk", now - Duration::minutes(5), Direction::Inbound);
        let log = reconcile_history(Some(local), vec![server_msg]);
        assert_eq!(log.len(), 2);
        assert_monotonic(&log);
        assert_eq!(log[1].id, "local-1");
        assert_eq!(log[1].delivery_state, DeliveryState::Pending);
    }

    #[test]
    fn test_reconcile_drops_confirmed_locals() {
        // Confirmed locals are superseded wholesale; only pendings carry over.
        let now = Utc::now();
        let local = vec![text_message("old-1", "superseded", now, Direction::Inbound)];
        let log = reconcile_history(Some(local), Vec::new());
        assert!(log.is_empty());
    }

    #[test]
    fn test_log_monotonic_under_mixed_operations() {
        let now = Utc::now();
        let mut log = Vec::new();
        insert_sorted(&mut log, text_message("a", "1", now - Duration::seconds(30), Direction::Inbound));
        insert_sorted(&mut log, pending("p1", "2", now, None));
        insert_sorted(&mut log, text_message("b", "3", now - Duration::seconds(10), Direction::Inbound));

        let server = vec![
            text_message("a", "1", now - Duration::seconds(30), Direction::Inbound),
            text_message("b", "3", now - Duration::seconds(10), Direction::Inbound),
        ];
        let log = reconcile_history(Some(log), server);
        assert_monotonic(&log);
        assert_eq!(log.last().unwrap().id, "p1");
    }
}
