// Roster synchronization.
// The roster is the ordered list of a user's conversations. Ordering is
// authoritative and single-criterion: most-recently-active first. State is
// merged from the bulk snapshot fetch and from push events; when the two
// disagree, preview fields follow a per-field recency guard keyed on the
// client clock (a fetch response loses to any push applied after the fetch
// started).

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::api::RosterRecord;
use crate::chat::{ChatClient, ChatUpdate};
use crate::models::{ContactStatus, Conversation};

/// Outcome of applying an inbound-message event to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Counterpart was present; preview/unread updated and entry moved to
    /// the head.
    Applied,
    /// Counterpart unknown; the caller must trigger a snapshot refetch.
    UnknownCounterpart,
}

/// Ordered conversation list with snapshot/push merge logic. Pure state,
/// no I/O; the client wraps it in the shared-state mutex.
#[derive(Debug, Default)]
pub struct Roster {
    entries: Vec<Conversation>,
}

impl Roster {
    pub fn new() -> Self {
        Roster { entries: Vec::new() }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.entries
    }

    pub fn get(&self, counterpart_id: &str) -> Option<&Conversation> {
        self.entries.iter().find(|c| c.id == counterpart_id)
    }

    pub fn get_mut(&mut self, counterpart_id: &str) -> Option<&mut Conversation> {
        self.entries.iter_mut().find(|c| c.id == counterpart_id)
    }

    pub fn contains(&self, counterpart_id: &str) -> bool {
        self.get(counterpart_id).is_some()
    }

    /// Seed the roster from a bulk snapshot, replacing any partial state.
    pub fn load_snapshot(&mut self, records: Vec<RosterRecord>) {
        self.entries = records.into_iter().map(conversation_from_record).collect();
        self.sort_by_recency();
        debug!("Roster seeded with {} conversations", self.entries.len());
    }

    /// Merge a later snapshot (periodic poll or unknown-counterpart refetch)
    /// without discarding loaded message logs. Preview fields are only
    /// overwritten when the fetch started after the last push touched them.
    pub fn merge_snapshot(&mut self, records: Vec<RosterRecord>, fetch_started: DateTime<Utc>) {
        for record in records {
            match self.get_mut(&record.user_id) {
                Some(existing) => {
                    existing.display_name = record.name;
                    existing.avatar_ref = record.avatar_ref;
                    existing.status = if record.online {
                        ContactStatus::Online
                    } else {
                        ContactStatus::Offline
                    };
                    existing.profile = record.profile;
                    if fetch_started >= existing.preview_updated_at {
                        existing.last_preview = record.last_message;
                        if let Some(time) = record.last_message_time {
                            existing.last_activity = time;
                        }
                        existing.unread_count = record.unread_count;
                        existing.preview_updated_at = fetch_started;
                    } else {
                        debug!(
                            "Skipping stale snapshot preview for {} (push won the race)",
                            existing.id
                        );
                    }
                }
                None => self.entries.push(conversation_from_record(record)),
            }
        }
        self.sort_by_recency();
    }

    /// Apply an inbound message event for `counterpart_id`. When the
    /// counterpart is present the entry moves to the head of the list and
    /// the relative order of all other entries is preserved.
    pub fn apply_inbound(
        &mut self,
        counterpart_id: &str,
        preview: &str,
        event_time: DateTime<Utc>,
        conversation_open: bool,
        now: DateTime<Utc>,
    ) -> InboundOutcome {
        let Some(entry) = self.get_mut(counterpart_id) else {
            info!(
                "Inbound message from unknown counterpart {}; snapshot refetch required",
                counterpart_id
            );
            return InboundOutcome::UnknownCounterpart;
        };

        entry.last_preview = Some(preview.to_string());
        entry.last_activity = event_time;
        entry.preview_updated_at = now;
        if !conversation_open {
            entry.unread_count += 1;
        }
        self.move_to_front(counterpart_id);
        InboundOutcome::Applied
    }

    /// Update preview/time for the sender's own optimistic send. No server
    /// echo is awaited.
    pub fn apply_sent(
        &mut self,
        conversation_id: &str,
        preview: &str,
        now: DateTime<Utc>,
    ) {
        if let Some(entry) = self.get_mut(conversation_id) {
            entry.last_preview = Some(preview.to_string());
            entry.last_activity = now;
            entry.preview_updated_at = now;
            self.move_to_front(conversation_id);
        } else {
            warn!("Optimistic send for conversation {} not in roster", conversation_id);
        }
    }

    /// Insert a freshly-created conversation at the head of the list.
    pub fn insert_front(&mut self, conversation: Conversation) {
        if self.contains(&conversation.id) {
            debug!("Conversation {} already present; skipping insert", conversation.id);
            return;
        }
        self.entries.insert(0, conversation);
    }

    fn move_to_front(&mut self, counterpart_id: &str) {
        if let Some(pos) = self.entries.iter().position(|c| c.id == counterpart_id) {
            let entry = self.entries.remove(pos);
            self.entries.insert(0, entry);
        }
    }

    fn sort_by_recency(&mut self) {
        // Stable sort: ties keep their relative order.
        self.entries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    }
}

pub(crate) fn conversation_from_record(record: RosterRecord) -> Conversation {
    let now = Utc::now();
    Conversation {
        id: record.user_id,
        display_name: record.name,
        avatar_ref: record.avatar_ref,
        status: if record.online {
            ContactStatus::Online
        } else {
            ContactStatus::Offline
        },
        last_preview: record.last_message,
        last_activity: record.last_message_time.unwrap_or(now),
        unread_count: record.unread_count,
        messages: None,
        profile: record.profile,
        preview_updated_at: now,
    }
}

impl ChatClient {
    /// Fetch the bulk snapshot and seed the roster, replacing local state.
    pub async fn load_snapshot(&self) -> Result<()> {
        let records = self
            .session()
            .api
            .fetch_roster(&self.session().user_id)
            .await?;
        {
            let mut state = self.state().lock().await;
            state.roster.load_snapshot(records);
        }
        self.push_update(ChatUpdate::RosterChanged).await;
        Ok(())
    }

    /// Re-fetch the snapshot and merge it under the recency guard. Used by
    /// the periodic poll and by the unknown-counterpart path.
    pub async fn refresh_roster(&self) -> Result<()> {
        let fetch_started = Utc::now();
        let records = self
            .session()
            .api
            .fetch_roster(&self.session().user_id)
            .await?;
        {
            let mut state = self.state().lock().await;
            state.roster.merge_snapshot(records, fetch_started);
        }
        self.push_update(ChatUpdate::RosterChanged).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(user_id: &str, minutes_ago: i64) -> RosterRecord {
        RosterRecord {
            user_id: user_id.to_string(),
            name: format!("User {}", user_id),
            avatar_ref: None,
            online: false,
            last_message: Some("hi".to_string()),
            last_message_time: Some(Utc::now() - Duration::minutes(minutes_ago)),
            unread_count: 0,
            profile: Default::default(),
        }
    }

    fn ids(roster: &Roster) -> Vec<&str> {
        roster.conversations().iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_snapshot_orders_by_recency() {
        let mut roster = Roster::new();
        roster.load_snapshot(vec![record("a", 30), record("b", 5), record("c", 60)]);
        assert_eq!(ids(&roster), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_inbound_moves_to_head_preserving_relative_order() {
        let mut roster = Roster::new();
        roster.load_snapshot(vec![record("a", 1), record("b", 2), record("c", 3), record("d", 4)]);

        let now = Utc::now();
        assert_eq!(
            roster.apply_inbound("c", "ping", now, false, now),
            InboundOutcome::Applied
        );
        assert_eq!(ids(&roster), vec!["c", "a", "b", "d"]);

        // N distinct counterparts end up head-first in reverse arrival order.
        let later = now + Duration::seconds(1);
        roster.apply_inbound("d", "ping", later, false, later);
        let latest = now + Duration::seconds(2);
        roster.apply_inbound("b", "ping", latest, false, latest);
        assert_eq!(ids(&roster), vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn test_inbound_unread_and_preview() {
        let mut roster = Roster::new();
        roster.load_snapshot(vec![record("a", 1)]);
        let now = Utc::now();

        roster.apply_inbound("a", "hello", now, false, now);
        let entry = roster.get("a").unwrap();
        assert_eq!(entry.unread_count, 1);
        assert_eq!(entry.last_preview.as_deref(), Some("hello"));

        // Open conversation: preview still updates, unread does not.
        roster.apply_inbound("a", "again", now, true, now);
        let entry = roster.get("a").unwrap();
        assert_eq!(entry.unread_count, 1);
        assert_eq!(entry.last_preview.as_deref(), Some("again"));
    }

    #[test]
    fn test_unknown_counterpart_reports_refetch() {
        let mut roster = Roster::new();
        roster.load_snapshot(vec![record("a", 1)]);
        let now = Utc::now();
        assert_eq!(
            roster.apply_inbound("stranger", "hi", now, false, now),
            InboundOutcome::UnknownCounterpart
        );
    }

    #[test]
    fn test_apply_sent_updates_preview_without_echo() {
        let mut roster = Roster::new();
        roster.load_snapshot(vec![record("a", 1), record("b", 2)]);
        let now = Utc::now();
        roster.apply_sent("b", "on my way", now);
        assert_eq!(ids(&roster), vec!["b", "a"]);
        assert_eq!(roster.get("b").unwrap().last_preview.as_deref(), Some("on my way"));
    }

    #[test]
    fn test_stale_snapshot_does_not_clobber_push() {
        let mut roster = Roster::new();
        roster.load_snapshot(vec![record("a", 10)]);

        // A push lands after the (slow) refetch started.
        let fetch_started = Utc::now() - Duration::seconds(5);
        let push_at = Utc::now();
        roster.apply_inbound("a", "fresh from push", push_at, false, push_at);

        let mut stale = record("a", 10);
        stale.last_message = Some("stale from fetch".to_string());
        stale.unread_count = 0;
        roster.merge_snapshot(vec![stale], fetch_started);

        let entry = roster.get("a").unwrap();
        assert_eq!(entry.last_preview.as_deref(), Some("fresh from push"));
        assert_eq!(entry.unread_count, 1);
    }

    #[test]
    fn test_merge_snapshot_adds_new_entries_and_keeps_logs() {
        let mut roster = Roster::new();
        roster.load_snapshot(vec![record("a", 1)]);
        roster.get_mut("a").unwrap().messages = Some(Vec::new());

        let fetch_started = Utc::now();
        roster.merge_snapshot(vec![record("a", 1), record("new", 0)], fetch_started);
        assert!(roster.contains("new"));
        assert!(roster.get("a").unwrap().is_loaded());
    }

    #[test]
    fn test_snapshot_presence_updates_in_place_without_reorder() {
        let mut roster = Roster::new();
        roster.load_snapshot(vec![record("a", 1), record("b", 2)]);

        let mut online = record("b", 2);
        online.online = true;
        roster.merge_snapshot(vec![online], Utc::now());

        assert_eq!(ids(&roster), vec!["a", "b"]);
        assert_eq!(roster.get("b").unwrap().status, ContactStatus::Online);
    }
}
