//! TOML configuration file loading
//!
//! Supports `~/.config/colloquy/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::transport::Dialect;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ColloquyConfigFile {
    /// Persona identifier (e.g. "colloquy")
    #[serde(default)]
    pub persona: Option<String>,

    /// Remote service configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Audio pipeline tuning
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Reconnection policy
    #[serde(default)]
    pub retry: RetryFileConfig,
}

/// Remote service configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// WebSocket endpoint
    pub endpoint: Option<String>,

    /// API key (prefer the environment)
    pub api_key: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// Prebuilt voice name
    pub voice: Option<String>,

    /// Wire framing (`media` or `gemini`); inferred from the endpoint
    pub dialect: Option<Dialect>,
}

/// Audio pipeline tuning
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Preferred microphone rate in Hz
    pub capture_rate: Option<u32>,

    /// Capture frame length in milliseconds
    pub frame_ms: Option<u32>,

    /// Playback lead time in milliseconds
    pub lead_time_ms: Option<u64>,

    /// Mix the inaudible keep-alive tone
    pub keep_alive: Option<bool>,

    /// Device resume interval in milliseconds
    pub heartbeat_ms: Option<u64>,

    /// Volume publish rate in Hz
    pub display_hz: Option<u32>,
}

/// Reconnection policy
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    /// Maximum consecutive reconnection attempts
    pub max_attempts: Option<u32>,

    /// Base delay in milliseconds
    pub base_delay_ms: Option<u64>,

    /// Delay cap in milliseconds
    pub max_delay_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ColloquyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ColloquyConfigFile {
    config_file_path().map_or_else(ColloquyConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from `path`
///
/// Returns `ColloquyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> ColloquyConfigFile {
    if !path.exists() {
        return ColloquyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ColloquyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ColloquyConfigFile::default()
        }
    }
}

/// Return the config directory: `~/.config/colloquy`
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("colloquy"))
}

/// Return the config file path: `~/.config/colloquy/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}
