// Push channel lifecycle for the sync client.
// Exactly one logical channel instance is live at a time; connecting bumps
// an epoch counter that invalidates the previous reader. Connectivity loss
// is reported to dependents as a state change, never as per-message errors,
// and reconnection runs in the background with capped exponential backoff.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::chat::events::{self, AuthenticatePayload, ClientEvent};
use crate::chat::{ChannelStream, ChatClient, ChatUpdate};
use crate::error::ChatError;

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;
const CONNECT_ATTEMPTS: u32 = 3;

/// Connectivity of the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ChatClient {
    /// Open the push channel and authenticate. Tries a few times inline
    /// with exponential backoff; if all attempts fail, hands off to the
    /// background reconnect loop and returns the last error.
    pub async fn connect(&self) -> Result<(), ChatError> {
        // The periodic roster poll guards against missed push events and
        // must run whether or not the channel ever comes up.
        self.spawn_roster_poll();
        self.set_channel_state(ChannelState::Connecting).await;
        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            info!(
                "Connecting push channel (attempt {}/{})",
                attempt, CONNECT_ATTEMPTS
            );
            match self.try_connect().await {
                Ok(()) => {
                    info!("Push channel connected");
                    return Ok(());
                }
                Err(e) => {
                    error!("Connect attempt {}/{} failed: {}", attempt, CONNECT_ATTEMPTS, e);
                    last_error = Some(e);
                }
            }
            if attempt < CONNECT_ATTEMPTS {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
                info!("Retrying connection in {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        self.set_channel_state(ChannelState::Error).await;
        self.spawn_reconnect();
        Err(ChatError::Connectivity(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "push channel unreachable".to_string()),
        ))
    }

    async fn try_connect(&self) -> Result<()> {
        let url = Url::parse(&format!(
            "{}/ws",
            self.session().config.channel_origin()
        ))?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut sink_half, stream_half) = ws_stream.split();

        // Authenticate inline, before the sink is published. Nothing may
        // reach the wire ahead of this frame.
        let auth = ClientEvent::Authenticate(AuthenticatePayload {
            token: self.session().token.clone(),
        });
        sink_half
            .send(WsMessage::Text(events::encode_client_event(&auth)?))
            .await?;

        // The new epoch invalidates any previous channel instance.
        let epoch = self.bump_epoch();
        *self.sink_handle().lock().await = Some(sink_half);
        self.spawn_reader(stream_half, epoch);

        self.set_channel_state(ChannelState::Connected).await;
        Ok(())
    }

    fn spawn_reader(&self, mut stream: ChannelStream, epoch: u64) {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                if client.current_epoch() != epoch {
                    debug!("Stale channel reader exiting");
                    return;
                }
                match frame {
                    Ok(WsMessage::Text(text)) => match events::decode_server_event(&text) {
                        Ok(event) => client.handle_server_event(event).await,
                        Err(e) => warn!("Ignoring undecodable frame: {}", e),
                    },
                    Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {} // binary frames never travel on this channel
                    Err(e) => {
                        warn!("Channel read error: {}", e);
                        break;
                    }
                }
            }
            if client.current_epoch() != epoch {
                // Replaced by a newer instance; nothing to report.
                return;
            }
            info!("Push channel disconnected");
            let _ = client.sink_handle().lock().await.take();
            client.set_channel_state(ChannelState::Disconnected).await;
            client.spawn_reconnect();
        });
    }

    /// Background reconnect loop with capped exponential backoff and
    /// jitter. Exits when a newer epoch appears (another connect or a
    /// deliberate disconnect).
    pub(crate) fn spawn_reconnect(&self) {
        let client = self.clone();
        let epoch_at_spawn = self.current_epoch();
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF_MS;
            loop {
                let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                if client.current_epoch() != epoch_at_spawn {
                    debug!("Reconnect loop superseded; exiting");
                    return;
                }
                info!("Reconnecting push channel...");
                match client.try_connect().await {
                    Ok(()) => {
                        info!("Push channel reconnected");
                        return;
                    }
                    Err(e) => warn!("Reconnect failed: {}", e),
                }
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        });
    }

    /// Close the channel deliberately. Invalidates the reader and the
    /// reconnect loop and tears down all per-conversation timers.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting push channel");
        self.bump_epoch();
        {
            let mut guard = self.sink_handle().lock().await;
            if let Some(mut ws) = guard.take() {
                if let Err(e) = ws.close().await {
                    warn!("Error closing channel: {}", e);
                }
            }
        }
        self.timers().lock().await.clear_all();
        self.set_channel_state(ChannelState::Disconnected).await;
        Ok(())
    }

    pub async fn channel_state(&self) -> ChannelState {
        self.channel_state_handle().lock().await.clone()
    }

    /// Record a connectivity transition and fan it out. No-op when the
    /// state is unchanged.
    pub(crate) async fn set_channel_state(&self, new_state: ChannelState) {
        {
            let mut guard = self.channel_state_handle().lock().await;
            if *guard == new_state {
                return;
            }
            *guard = new_state.clone();
        }
        self.push_update(ChatUpdate::Connectivity(new_state)).await;
    }
}
