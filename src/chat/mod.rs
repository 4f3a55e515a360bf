// Conversation sync client for the AlumNet platform.
// This module is the entry point for the real-time engine: it owns the push
// channel, the shared conversation state, and the update stream the
// embedding application consumes. Organized by concern, one submodule each.

use anyhow::{anyhow, Result};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::SinkExt;

// Submodules, one per concern.
pub mod connection;
pub mod events;
pub mod outbound;
pub mod roster;
pub mod store;
pub mod typing;
pub mod unread;

pub use connection::ChannelState;
pub use outbound::ATTACHMENT_RELOAD_DELAY_MS;
pub use roster::{InboundOutcome, Roster};
pub use typing::{TypingTracker, TYPING_THROTTLE_MS};

use crate::api::ChatApi;
use crate::config::SyncConfig;
use crate::models::{Conversation, DirectoryEntry, Message};
use events::{ClientEvent, NewMessagePayload, ServerEvent};

/// Defense-in-depth roster poll, independent of the push channel.
pub const ROSTER_POLL_INTERVAL_SECS: u64 = 30;

const CHANNEL_SEND_TIMEOUT_MS: u64 = 500;

pub(crate) type ChannelSink =
    SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
pub(crate) type ChannelStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Explicit session state handed to every component that needs the current
/// user, configuration, or request/response backend. Nothing ambient.
pub struct SessionContext {
    pub user_id: String,
    pub token: String,
    pub config: SyncConfig,
    pub api: Arc<dyn ChatApi>,
}

/// State changes fanned out to the embedding application.
#[derive(Debug, Clone)]
pub enum ChatUpdate {
    Connectivity(ChannelState),
    MessageReceived {
        conversation_id: String,
        message: Message,
    },
    RosterChanged,
    HistoryLoaded {
        conversation_id: String,
    },
    Typing {
        conversation_id: String,
        active: bool,
    },
    UnreadChanged {
        conversation_id: String,
        count: u32,
    },
    MessagesReadByCounterpart {
        counterpart_id: String,
    },
    TransientError(String),
}

/// Shared mutable state behind the client's mutex.
pub(crate) struct ChatState {
    pub roster: Roster,
    pub typing: TypingTracker,
    pub open_conversation: Option<String>,
}

impl ChatState {
    fn new() -> Self {
        ChatState {
            roster: Roster::new(),
            typing: TypingTracker::new(),
            open_conversation: None,
        }
    }
}

/// Per-conversation cancellable timers. Arming a timer aborts its
/// predecessor; closing a conversation tears both kinds down so no callback
/// outlives its owner.
#[derive(Default)]
pub(crate) struct TimerRegistry {
    typing_expiry: HashMap<String, JoinHandle<()>>,
    history_reload: HashMap<String, JoinHandle<()>>,
}

impl TimerRegistry {
    pub fn set_typing_expiry(&mut self, conversation_id: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.typing_expiry.insert(conversation_id.to_string(), handle) {
            previous.abort();
        }
    }

    pub fn set_history_reload(&mut self, conversation_id: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.history_reload.insert(conversation_id.to_string(), handle) {
            previous.abort();
        }
    }

    pub fn clear_conversation(&mut self, conversation_id: &str) {
        if let Some(handle) = self.typing_expiry.remove(conversation_id) {
            handle.abort();
        }
        if let Some(handle) = self.history_reload.remove(conversation_id) {
            handle.abort();
        }
    }

    pub fn clear_all(&mut self) {
        for (_, handle) in self.typing_expiry.drain() {
            handle.abort();
        }
        for (_, handle) in self.history_reload.drain() {
            handle.abort();
        }
    }
}

/// The conversation synchronization client. Cheap to clone; all clones share
/// the same channel, state, and timers.
#[derive(Clone)]
pub struct ChatClient {
    session: Arc<SessionContext>,
    state: Arc<TokioMutex<ChatState>>,
    sink: Arc<TokioMutex<Option<ChannelSink>>>,
    channel_state: Arc<TokioMutex<ChannelState>>,
    conn_epoch: Arc<AtomicU64>,
    update_tx: mpsc::Sender<ChatUpdate>,
    timers: Arc<TokioMutex<TimerRegistry>>,
    poll_started: Arc<AtomicBool>,
}

impl ChatClient {
    pub fn new(session: SessionContext) -> (Self, mpsc::Receiver<ChatUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(100);
        (
            ChatClient {
                session: Arc::new(session),
                state: Arc::new(TokioMutex::new(ChatState::new())),
                sink: Arc::new(TokioMutex::new(None)),
                channel_state: Arc::new(TokioMutex::new(ChannelState::Disconnected)),
                conn_epoch: Arc::new(AtomicU64::new(0)),
                update_tx,
                timers: Arc::new(TokioMutex::new(TimerRegistry::default())),
                poll_started: Arc::new(AtomicBool::new(false)),
            },
            update_rx,
        )
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub(crate) fn state(&self) -> &Arc<TokioMutex<ChatState>> {
        &self.state
    }

    pub(crate) fn timers(&self) -> &Arc<TokioMutex<TimerRegistry>> {
        &self.timers
    }

    pub(crate) fn sink_handle(&self) -> &Arc<TokioMutex<Option<ChannelSink>>> {
        &self.sink
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.conn_epoch.load(Ordering::SeqCst)
    }

    /// Invalidate the previous channel instance. Exactly one epoch is live.
    pub(crate) fn bump_epoch(&self) -> u64 {
        self.conn_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) async fn push_update(&self, update: ChatUpdate) {
        if let Err(e) = self.update_tx.send(update).await {
            debug!("No update consumer attached: {}", e);
        }
    }

    /// Fire-and-forget send over the push channel. Events emitted while the
    /// channel is down are dropped with a warning, never queued or replayed.
    pub(crate) fn emit_event(&self, event: ClientEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let frame = match events::encode_client_event(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("{}", e);
                    return;
                }
            };
            let send_result = tokio::time::timeout(
                Duration::from_millis(CHANNEL_SEND_TIMEOUT_MS),
                async {
                    let mut guard = sink.lock().await;
                    match guard.as_mut() {
                        Some(ws) => ws
                            .send(WsMessage::Text(frame))
                            .await
                            .map_err(|e| anyhow!("channel send failed: {}", e)),
                        None => Err(anyhow!("channel not connected")),
                    }
                },
            )
            .await;
            match send_result {
                Ok(Ok(())) => debug!("Pushed client event over the channel"),
                Ok(Err(e)) => warn!("Dropped outbound event (not queued): {}", e),
                Err(_) => warn!("Timed out pushing client event; dropped"),
            }
        });
    }

    /// Apply one server-pushed event to local state. Events arrive
    /// at-most-once in channel order; anything undecodable was already
    /// dropped by the reader.
    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ConnectionEstablished => {
                debug!("Channel handshake acknowledged by server");
            }
            ServerEvent::NewMessage(payload) => self.handle_new_message(payload).await,
            ServerEvent::Typing(payload) => self.handle_typing_push(&payload.sender_id).await,
            ServerEvent::MessagesRead(payload) => {
                self.handle_messages_read(&payload.reader_id).await
            }
        }
    }

    async fn handle_new_message(&self, payload: NewMessagePayload) {
        let now = chrono::Utc::now();
        // Push events carry no server message id; mint a local one.
        let message = payload.to_message(&format!("push-{}", uuid::Uuid::new_v4()));
        let preview = message.content.preview();
        let counterpart_id = payload.sender_id.clone();

        let (outcome, open) = {
            let mut state = self.state.lock().await;
            let open = state.open_conversation.as_deref() == Some(counterpart_id.as_str());
            let outcome = state.roster.apply_inbound(
                &counterpart_id,
                &preview,
                payload.created_at,
                open,
                now,
            );
            if outcome == InboundOutcome::Applied && open {
                // Only the open conversation's live log is appended to; a
                // closed one catches up when it is next loaded.
                if let Some(entry) = state.roster.get_mut(&counterpart_id) {
                    match entry.messages.as_mut() {
                        Some(log) => {
                            store::insert_sorted(log, message.clone());
                        }
                        None => entry.messages = Some(vec![message.clone()]),
                    }
                }
            }
            (outcome, open)
        };

        match outcome {
            InboundOutcome::Applied => {
                if open {
                    self.push_update(ChatUpdate::MessageReceived {
                        conversation_id: counterpart_id.clone(),
                        message,
                    })
                    .await;
                } else {
                    let count = {
                        let state = self.state.lock().await;
                        state
                            .roster
                            .get(&counterpart_id)
                            .map(|c| c.unread_count)
                            .unwrap_or(0)
                    };
                    self.push_update(ChatUpdate::UnreadChanged {
                        conversation_id: counterpart_id.clone(),
                        count,
                    })
                    .await;
                }
                self.push_update(ChatUpdate::RosterChanged).await;
            }
            InboundOutcome::UnknownCounterpart => {
                // Asynchronous full refetch; a bounded inconsistency window
                // is acceptable here.
                let client = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.refresh_roster().await {
                        warn!("Snapshot refetch after unknown counterpart failed: {}", e);
                    }
                });
            }
        }
    }

    /// Mark a conversation as the open one: zero its unread count
    /// optimistically, acknowledge on both paths, and load full history.
    pub async fn open_conversation(&self, counterpart_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.open_conversation = Some(counterpart_id.to_string());
        }
        self.acknowledge_read(counterpart_id).await;
        self.load_history(counterpart_id).await
    }

    /// Close the open conversation and tear down its timers. In-flight
    /// history fetches are deliberately not cancelled; the recency guard
    /// bounds what a late response may overwrite.
    pub async fn close_conversation(&self) {
        let closed = {
            let mut state = self.state.lock().await;
            state.open_conversation.take()
        };
        if let Some(conversation_id) = closed {
            self.timers.lock().await.clear_conversation(&conversation_id);
            let mut state = self.state.lock().await;
            state.typing.clear(&conversation_id);
        }
    }

    /// Create a conversation record for a counterpart not yet in the roster
    /// and insert it at the head of the list.
    pub async fn start_conversation(&self, counterpart_id: &str) -> Result<Conversation> {
        let record = self
            .session
            .api
            .create_conversation(&self.session.user_id, counterpart_id)
            .await?;
        let conversation = roster::conversation_from_record(record);
        {
            let mut state = self.state.lock().await;
            state.roster.insert_front(conversation.clone());
        }
        self.push_update(ChatUpdate::RosterChanged).await;
        Ok(conversation)
    }

    /// Search the user directory for new conversation counterparts.
    pub async fn search_directory(&self, query: &str) -> Result<Vec<DirectoryEntry>> {
        self.session.api.search_directory(query).await
    }

    /// Snapshot of the ordered roster for presentation.
    pub async fn conversations(&self) -> Vec<Conversation> {
        let state = self.state.lock().await;
        state.roster.conversations().to_vec()
    }

    pub async fn conversation(&self, counterpart_id: &str) -> Option<Conversation> {
        let state = self.state.lock().await;
        state.roster.get(counterpart_id).cloned()
    }

    /// Start the periodic roster poll. Runs for the lifetime of the client
    /// regardless of channel health; idempotent.
    pub(crate) fn spawn_roster_poll(&self) {
        if self.poll_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(ROSTER_POLL_INTERVAL_SECS));
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                if let Err(e) = client.refresh_roster().await {
                    warn!("Periodic roster poll failed: {}", e);
                }
            }
        });
    }

    pub(crate) fn channel_state_handle(&self) -> &Arc<TokioMutex<ChannelState>> {
        &self.channel_state
    }
}
