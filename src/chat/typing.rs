// Typing signal tracking.
// Inbound typing events set a TTL-bound signal per conversation; a fresh
// event extends the TTL. Outbound notifications are throttled so a burst of
// keystrokes produces at most one typing event per coalescing window.
// Expiry timers are explicit, cancellable, and torn down when their owning
// conversation is closed.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::HashMap;

use crate::chat::events::{ClientEvent, OutboundTypingPayload};
use crate::chat::{ChatClient, ChatUpdate};
use crate::models::{TypingSignal, TYPING_TTL_MS};

/// At most one outbound typing event per conversation per window.
pub const TYPING_THROTTLE_MS: i64 = 2000;

/// TTL-bound typing state per conversation. Pure state, queried against a
/// caller-supplied clock so it can be tested without timers.
#[derive(Debug, Default)]
pub struct TypingTracker {
    signals: HashMap<String, TypingSignal>,
    last_notified: HashMap<String, DateTime<Utc>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound typing event, starting or extending the TTL.
    pub fn on_push(&mut self, conversation_id: &str, now: DateTime<Utc>) {
        match self.signals.get_mut(conversation_id) {
            Some(signal) => signal.refresh(now),
            None => {
                self.signals
                    .insert(conversation_id.to_string(), TypingSignal::new(conversation_id, now));
            }
        }
    }

    pub fn is_typing(&self, conversation_id: &str, now: DateTime<Utc>) -> bool {
        self.signals
            .get(conversation_id)
            .map(|s| s.is_live(now))
            .unwrap_or(false)
    }

    /// Drop the signal if its TTL has elapsed. Returns true when something
    /// was actually cleared; a refreshed signal stays put.
    pub fn clear_if_expired(&mut self, conversation_id: &str, now: DateTime<Utc>) -> bool {
        match self.signals.get(conversation_id) {
            Some(signal) if !signal.is_live(now) => {
                self.signals.remove(conversation_id);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self, conversation_id: &str) {
        self.signals.remove(conversation_id);
    }

    /// Whether an outbound typing notification may be sent now; records the
    /// send time when it may.
    pub fn should_notify(&mut self, conversation_id: &str, now: DateTime<Utc>) -> bool {
        let window = Duration::milliseconds(TYPING_THROTTLE_MS);
        match self.last_notified.get(conversation_id) {
            Some(last) if now - *last < window => false,
            _ => {
                self.last_notified.insert(conversation_id.to_string(), now);
                true
            }
        }
    }
}

impl ChatClient {
    /// Apply an inbound typing push: set the signal, notify the embedding
    /// application, and (re)arm the cancellable expiry timer.
    pub(crate) async fn handle_typing_push(&self, counterpart_id: &str) {
        let now = Utc::now();
        {
            let mut state = self.state().lock().await;
            state.typing.on_push(counterpart_id, now);
        }
        self.push_update(ChatUpdate::Typing {
            conversation_id: counterpart_id.to_string(),
            active: true,
        })
        .await;

        let client = self.clone();
        let conversation_id = counterpart_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(TYPING_TTL_MS as u64)).await;
            let cleared = {
                let mut state = client.state().lock().await;
                state.typing.clear_if_expired(&conversation_id, Utc::now())
            };
            if cleared {
                debug!("Typing signal for {} expired", conversation_id);
                client
                    .push_update(ChatUpdate::Typing {
                        conversation_id,
                        active: false,
                    })
                    .await;
            }
        });
        self.timers()
            .lock()
            .await
            .set_typing_expiry(counterpart_id, handle);
    }

    /// Throttled fire-and-forget outbound typing notification. Call on every
    /// keystroke; at most one event per window actually goes out.
    pub async fn notify_typing(&self, counterpart_id: &str) {
        let should_send = {
            let mut state = self.state().lock().await;
            state.typing.should_notify(counterpart_id, Utc::now())
        };
        if should_send {
            self.emit_event(ClientEvent::Typing(OutboundTypingPayload {
                receiver_id: counterpart_id.to_string(),
            }));
        }
    }

    pub async fn is_counterpart_typing(&self, counterpart_id: &str) -> bool {
        let state = self.state().lock().await;
        state.typing.is_typing(counterpart_id, Utc::now())
    }
}
