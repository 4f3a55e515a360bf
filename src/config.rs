use anyhow::{anyhow, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

/// Externally-supplied origins for the two server-side surfaces: the
/// request/response API and the media-serving host. The push channel origin
/// is derived from the API origin unless set explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    pub api_origin: String,
    pub media_origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_origin: Option<String>,
}

impl SyncConfig {
    pub fn new(api_origin: &str, media_origin: &str) -> Self {
        SyncConfig {
            api_origin: api_origin.trim_end_matches('/').to_string(),
            media_origin: media_origin.trim_end_matches('/').to_string(),
            channel_origin: None,
        }
    }

    /// WebSocket origin for the push channel. Defaults to the API origin
    /// with the scheme switched to ws/wss.
    pub fn channel_origin(&self) -> String {
        if let Some(origin) = &self.channel_origin {
            return origin.trim_end_matches('/').to_string();
        }
        let api = self.api_origin.trim_end_matches('/');
        if let Some(rest) = api.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = api.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            api.to_string()
        }
    }

    pub fn media_url(&self, remote_ref: &str) -> String {
        format!("{}/{}", self.media_origin, remote_ref.trim_start_matches('/'))
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("alumnet-sync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn save_config(config: &SyncConfig) -> Result<()> {
    let config_path = get_config_path()?;
    let file = File::create(config_path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Config saved for API origin {}", config.api_origin);
    Ok(())
}

pub fn load_config() -> Result<Option<SyncConfig>> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(None);
    }

    let config_path_str = config_path.display().to_string();

    let mut file = File::open(config_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: SyncConfig = serde_json::from_str(&contents)?;
    info!("Loaded config from {}", config_path_str);

    Ok(Some(config))
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config persistence at an explicit file. Used by tests.
pub fn set_config_path_override(path: PathBuf) -> Result<()> {
    CONFIG_PATH_OVERRIDE
        .set(path)
        .map_err(|_| anyhow!("Config path override already set"))
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}
