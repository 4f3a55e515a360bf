use thiserror::Error;

/// Failure classes surfaced to the embedding application.
///
/// Connectivity problems drive reconnection and a state-change update, never
/// per-message errors. Request failures are transient notices; the optimistic
/// state that triggered them is not rolled back. Validation failures are
/// rejected before any network call.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("channel unavailable: {0}")]
    Connectivity(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("message has no text and no attachments")]
    EmptyMessage,
}

impl ChatError {
    pub fn request(err: impl std::fmt::Display) -> Self {
        ChatError::Request(err.to_string())
    }
}
