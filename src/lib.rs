// Real-time conversation sync engine for the AlumNet community platform.
pub mod api;
pub mod chat; // The sync client and its per-concern submodules
pub mod config;
pub mod error;
pub mod models;

// Re-export main types for convenience
pub use chat::{ChatClient, ChatUpdate, ChannelState, SessionContext};
pub use config::SyncConfig;
pub use error::ChatError;
pub use models::*;
