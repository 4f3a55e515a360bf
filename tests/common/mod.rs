// Common test utilities for integration tests
// This module contains shared code for all integration tests: logging
// setup, an in-memory backend standing in for the request/response API,
// and fixture builders for snapshot/history/push data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::LevelFilter;

use alumnet_sync::api::{ChatApi, HistoryRecord, MediaMessageRequest, RosterRecord};
use alumnet_sync::chat::events::{NewMessagePayload, ServerEvent};
use alumnet_sync::chat::{ChatClient, ChatUpdate, SessionContext};
use alumnet_sync::models::DirectoryEntry;
use alumnet_sync::SyncConfig;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// In-memory stand-in for the platform API. Records every call so tests
/// can assert on the traffic the engine generates.
#[derive(Default)]
pub struct MockBackend {
    pub roster: Mutex<Vec<RosterRecord>>,
    pub history: Mutex<HashMap<String, Vec<HistoryRecord>>>,
    pub directory: Mutex<Vec<DirectoryEntry>>,
    pub roster_fetches: AtomicUsize,
    pub history_fetches: Mutex<Vec<String>>,
    pub unread_writes: Mutex<Vec<(String, u32)>>,
    pub media_submissions: Mutex<Vec<MediaMessageRequest>>,
    pub fail_unread_writes: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_roster(&self, records: Vec<RosterRecord>) {
        *self.roster.lock().unwrap() = records;
    }

    pub fn set_history(&self, counterpart_id: &str, records: Vec<HistoryRecord>) {
        self.history
            .lock()
            .unwrap()
            .insert(counterpart_id.to_string(), records);
    }

    pub fn roster_fetch_count(&self) -> usize {
        self.roster_fetches.load(Ordering::SeqCst)
    }

    pub fn history_fetches(&self) -> Vec<String> {
        self.history_fetches.lock().unwrap().clone()
    }

    pub fn unread_writes(&self) -> Vec<(String, u32)> {
        self.unread_writes.lock().unwrap().clone()
    }

    pub fn media_submission_count(&self) -> usize {
        self.media_submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatApi for MockBackend {
    async fn fetch_roster(&self, _user_id: &str) -> Result<Vec<RosterRecord>> {
        self.roster_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.roster.lock().unwrap().clone())
    }

    async fn fetch_history(
        &self,
        _user_id: &str,
        counterpart_id: &str,
    ) -> Result<Vec<HistoryRecord>> {
        self.history_fetches
            .lock()
            .unwrap()
            .push(counterpart_id.to_string());
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(counterpart_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn submit_media_message(&self, request: MediaMessageRequest) -> Result<()> {
        self.media_submissions.lock().unwrap().push(request);
        Ok(())
    }

    async fn set_unread_count(
        &self,
        _user_id: &str,
        counterpart_id: &str,
        count: u32,
    ) -> Result<()> {
        if self.fail_unread_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated unread write failure"));
        }
        self.unread_writes
            .lock()
            .unwrap()
            .push((counterpart_id.to_string(), count));
        Ok(())
    }

    async fn create_conversation(
        &self,
        _user_id: &str,
        counterpart_id: &str,
    ) -> Result<RosterRecord> {
        Ok(roster_record(counterpart_id, &format!("User {}", counterpart_id), 0))
    }

    async fn search_directory(&self, query: &str) -> Result<Vec<DirectoryEntry>> {
        Ok(self
            .directory
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name.to_lowercase().contains(&query.to_lowercase()))
            .cloned()
            .collect())
    }
}

pub fn roster_record(user_id: &str, name: &str, minutes_ago: i64) -> RosterRecord {
    RosterRecord {
        user_id: user_id.to_string(),
        name: name.to_string(),
        avatar_ref: None,
        online: false,
        last_message: Some("earlier chatter".to_string()),
        last_message_time: Some(Utc::now() - Duration::minutes(minutes_ago)),
        unread_count: 0,
        profile: Default::default(),
    }
}

pub fn history_record(
    id: &str,
    sender_id: &str,
    receiver_id: &str,
    text: &str,
    minutes_ago: i64,
) -> HistoryRecord {
    HistoryRecord {
        id: id.to_string(),
        sender_id: sender_id.to_string(),
        receiver_id: receiver_id.to_string(),
        text: Some(text.to_string()),
        media_refs: Vec::new(),
        media_kind: None,
        client_ref: None,
        created_at: Utc::now() - Duration::minutes(minutes_ago),
    }
}

/// Push event for an inbound text message from `sender_id`.
pub fn new_message_event(sender_id: &str, text: &str) -> ServerEvent {
    ServerEvent::NewMessage(NewMessagePayload {
        sender_id: sender_id.to_string(),
        sender_name: format!("User {}", sender_id),
        avatar_ref: None,
        text: Some(text.to_string()),
        media_refs: Vec::new(),
        media_kind: None,
        client_ref: None,
        created_at: Utc::now(),
    })
}

/// Build a client as user "alice" seeded with the given snapshot.
pub async fn client_with_roster(
    records: Vec<RosterRecord>,
) -> (
    ChatClient,
    tokio::sync::mpsc::Receiver<ChatUpdate>,
    Arc<MockBackend>,
) {
    setup_logging();
    let backend = MockBackend::new();
    backend.set_roster(records);

    let session = SessionContext {
        user_id: "alice".to_string(),
        token: "test-token".to_string(),
        config: SyncConfig::new("http://localhost:4000", "http://localhost:4000/media"),
        api: backend.clone(),
    };
    let (client, update_rx) = ChatClient::new(session);
    client.load_snapshot().await.expect("snapshot load");
    (client, update_rx, backend)
}

/// Drain queued updates, returning everything currently buffered.
pub fn drain_updates(rx: &mut tokio::sync::mpsc::Receiver<ChatUpdate>) -> Vec<ChatUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}
