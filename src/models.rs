use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// How long a typing signal stays alive without a refresh.
pub const TYPING_TTL_MS: i64 = 3000;

#[derive(Debug, Clone, PartialEq)]
pub enum ContactStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    File,
}

impl MediaKind {
    /// Classify a file by extension. Anything unrecognized is a generic file.
    pub fn from_path(path: &std::path::Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => MediaKind::Image,
            "mp3" | "ogg" | "wav" | "m4a" | "aac" => MediaKind::Audio,
            "mp4" | "webm" | "mkv" | "mov" | "avi" => MediaKind::Video,
            _ => MediaKind::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,   // Created locally, not yet seen in server history
    Confirmed, // Present in server history or received via push
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub kind: MediaKind,
    /// Source file on disk before upload.
    pub local_path: Option<PathBuf>,
    /// Server-assigned reference after upload.
    pub remote_ref: Option<String>,
}

impl Attachment {
    pub fn from_local(path: PathBuf) -> Self {
        Attachment {
            kind: MediaKind::from_path(&path),
            local_path: Some(path),
            remote_ref: None,
        }
    }

    pub fn from_remote(kind: MediaKind, remote_ref: String) -> Self {
        Attachment {
            kind,
            local_path: None,
            remote_ref: Some(remote_ref),
        }
    }
}

/// Message body: either plain text or text-with-attachments. The explicit
/// discriminant replaces runtime shape inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text {
        body: String,
    },
    WithAttachments {
        body: Option<String>,
        attachments: Vec<Attachment>,
    },
}

impl MessageContent {
    /// Text to show in roster previews. Attachment-only messages preview
    /// as their media kind.
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { body } => body.clone(),
            MessageContent::WithAttachments { body, attachments } => match body {
                Some(text) if !text.is_empty() => text.clone(),
                _ => match attachments.first().map(|a| a.kind) {
                    Some(MediaKind::Image) => "[image]".to_string(),
                    Some(MediaKind::Audio) => "[audio]".to_string(),
                    Some(MediaKind::Video) => "[video]".to_string(),
                    _ => "[file]".to_string(),
                },
            },
        }
    }

    pub fn body_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { body } => Some(body.as_str()),
            MessageContent::WithAttachments { body, .. } => body.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Server id once known; a locally-generated temporary id before that.
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    /// Stable client-generated reference attached at creation and echoed
    /// back by the server, used to deduplicate optimistic sends against
    /// reloaded history.
    pub client_ref: Option<Uuid>,
}

impl Message {
    /// Build a sender-authored message ready for optimistic insertion.
    pub fn outbound(conversation_id: &str, content: MessageContent) -> Self {
        let client_ref = Uuid::new_v4();
        Message {
            id: format!("local-{}", client_ref),
            conversation_id: conversation_id.to_string(),
            direction: Direction::Outbound,
            content,
            created_at: Utc::now(),
            delivery_state: DeliveryState::Pending,
            client_ref: Some(client_ref),
        }
    }
}

/// Alumni-directory metadata carried on a conversation counterpart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub batch: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    /// Counterpart identity. Unique within the roster.
    pub id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub status: ContactStatus,
    pub last_preview: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
    /// Ordered message log; `None` until history is loaded.
    pub messages: Option<Vec<Message>>,
    pub profile: ProfileSummary,
    /// When a push event last touched the preview fields. Fetch responses
    /// that started before this instant must not overwrite them.
    pub preview_updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: &str, display_name: &str) -> Self {
        Conversation {
            id: id.to_string(),
            display_name: display_name.to_string(),
            avatar_ref: None,
            status: ContactStatus::Offline,
            last_preview: None,
            last_activity: Utc::now(),
            unread_count: 0,
            messages: None,
            profile: ProfileSummary::default(),
            preview_updated_at: Utc::now(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.messages.is_some()
    }
}

/// Ephemeral typing indicator for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingSignal {
    pub conversation_id: String,
    pub expires_at: DateTime<Utc>,
}

impl TypingSignal {
    pub fn new(conversation_id: &str, now: DateTime<Utc>) -> Self {
        TypingSignal {
            conversation_id: conversation_id.to_string(),
            expires_at: now + Duration::milliseconds(TYPING_TTL_MS),
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Extend the TTL from a fresh event.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.expires_at = now + Duration::milliseconds(TYPING_TTL_MS);
    }
}

/// A user-directory search hit, used when starting a new conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub profile: ProfileSummary,
}
