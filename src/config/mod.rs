//! Configuration management for Colloquy
//!
//! Values resolve as environment, then config file, then defaults. The CLI
//! layers its own flags on top.

pub mod file;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::session::{RetryPolicy, SessionOptions};
use crate::transport::{Dialect, SessionConfig};
use crate::{Error, Persona, Result};

use file::ColloquyConfigFile;

/// Default live service endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default model identifier
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";

/// Voice used when neither config nor persona names one
pub const DEFAULT_VOICE: &str = "Fenrir";

/// Persona used when none is requested
pub const DEFAULT_PERSONA: &str = "colloquy";

/// Highest volume publish rate accepted
pub const MAX_DISPLAY_HZ: u32 = 1000;

/// Colloquy configuration
#[derive(Clone)]
pub struct Config {
    /// Active persona
    pub persona: Persona,

    /// WebSocket endpoint of the live service
    pub endpoint: String,

    /// API key for the live service
    pub api_key: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// Wire framing spoken by the endpoint
    pub dialect: Dialect,

    /// Audio pipeline tuning
    pub audio: AudioConfig,

    /// Reconnection policy
    pub retry: RetryPolicy,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("persona", &self.persona.id())
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("dialect", &self.dialect)
            .field("audio", &self.audio)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Audio pipeline tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// Preferred microphone rate in Hz
    pub capture_rate: u32,

    /// Capture frame length in milliseconds
    pub frame_ms: u32,

    /// Playback lead time after the timeline falls behind
    pub lead_time: Duration,

    /// Mix the inaudible keep-alive tone while live
    pub keep_alive: bool,

    /// Device resume interval
    pub heartbeat: Duration,

    /// Volume publish rate in Hz
    pub display_hz: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_rate: crate::audio::capture::SAMPLE_RATE,
            frame_ms: crate::audio::capture::FRAME_MS,
            lead_time: Duration::from_millis(50),
            keep_alive: true,
            heartbeat: Duration::from_secs(1),
            display_hz: 60,
        }
    }
}

impl Config {
    /// Load configuration for a persona
    ///
    /// Reads the config file and the process environment. `persona_id`
    /// overrides the persona named in the file.
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be found or a value is invalid
    pub fn load(persona_id: Option<&str>) -> Result<Self> {
        Self::load_with_endpoint(persona_id, None)
    }

    /// Load configuration with an endpoint that outranks every other source
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be found or a value is invalid
    pub fn load_with_endpoint(persona_id: Option<&str>, endpoint: Option<&str>) -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, persona_id, |key| match (key, endpoint) {
            ("COLLOQUY_ENDPOINT", Some(endpoint)) => Some(endpoint.to_string()),
            _ => std::env::var(key).ok(),
        })
    }

    /// Resolve configuration from a config file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be found or a value is invalid
    pub fn resolve<F>(fc: ColloquyConfigFile, persona_id: Option<&str>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let persona_id = persona_id
            .map(ToString::to_string)
            .or_else(|| env("COLLOQUY_PERSONA"))
            .or(fc.persona)
            .unwrap_or_else(|| DEFAULT_PERSONA.to_string());
        let persona = load_persona_with_priority(&persona_id, env("COLLOQUY_PERSONAS_DIR"))?;

        let endpoint = env("COLLOQUY_ENDPOINT")
            .or(fc.session.endpoint)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        url::Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint}: {e}")))?;

        // API key (env > legacy env > toml > None)
        let api_key = env("COLLOQUY_API_KEY")
            .or_else(|| env("GEMINI_API_KEY"))
            .or(fc.session.api_key)
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);

        let model = env("COLLOQUY_MODEL")
            .or(fc.session.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let voice = env("COLLOQUY_VOICE")
            .or(fc.session.voice)
            .or_else(|| persona.voice_name().map(ToString::to_string))
            .unwrap_or_else(|| DEFAULT_VOICE.to_string());

        let dialect = match env("COLLOQUY_DIALECT") {
            Some(value) => value.parse()?,
            None => fc
                .session
                .dialect
                .unwrap_or_else(|| Dialect::for_endpoint(&endpoint)),
        };

        let defaults = AudioConfig::default();
        let audio = AudioConfig {
            capture_rate: fc.audio.capture_rate.unwrap_or(defaults.capture_rate),
            frame_ms: fc.audio.frame_ms.unwrap_or(defaults.frame_ms),
            lead_time: fc
                .audio
                .lead_time_ms
                .map_or(defaults.lead_time, Duration::from_millis),
            keep_alive: fc.audio.keep_alive.unwrap_or(defaults.keep_alive),
            heartbeat: fc
                .audio
                .heartbeat_ms
                .map_or(defaults.heartbeat, Duration::from_millis),
            display_hz: fc.audio.display_hz.unwrap_or(defaults.display_hz),
        };

        if audio.capture_rate == 0 || audio.frame_ms == 0 || audio.display_hz == 0 {
            return Err(Error::Config(
                "audio capture_rate, frame_ms and display_hz must be positive".to_string(),
            ));
        }
        if audio.display_hz > MAX_DISPLAY_HZ {
            return Err(Error::Config(format!(
                "audio display_hz must be at most {MAX_DISPLAY_HZ}"
            )));
        }
        if audio.heartbeat.is_zero() {
            return Err(Error::Config("audio heartbeat_ms must be positive".to_string()));
        }

        let policy = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: fc.retry.max_attempts.unwrap_or(policy.max_attempts),
            base_delay: fc
                .retry
                .base_delay_ms
                .map_or(policy.base_delay, Duration::from_millis),
            max_delay: fc
                .retry
                .max_delay_ms
                .map_or(policy.max_delay, Duration::from_millis),
        };

        Ok(Self {
            persona,
            endpoint,
            api_key,
            model,
            voice,
            dialect,
            audio,
            retry,
        })
    }

    /// Channel parameters for a live session
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_instruction: self.persona.session_instruction(),
            dialect: self.dialect,
        }
    }

    /// Supervisor options for a live session
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            session: self.session_config(),
            retry: self.retry.clone(),
            frame_ms: self.audio.frame_ms,
            lead_time: self.audio.lead_time,
            keep_alive: self.audio.keep_alive,
            heartbeat: self.audio.heartbeat,
            display_interval: Duration::from_secs(1) / self.audio.display_hz,
        }
    }
}

/// Load a persona with priority: env override, user directory, embedded
///
/// # Errors
///
/// Returns error if persona cannot be loaded from any source
fn load_persona_with_priority(persona_id: &str, env_dir: Option<String>) -> Result<Persona> {
    // 1. COLLOQUY_PERSONAS_DIR (dev override)
    if let Some(dir) = env_dir {
        let path = PathBuf::from(&dir);
        if path.exists() {
            match load_persona(&path, persona_id) {
                Ok(persona) => {
                    tracing::info!(
                        persona_id,
                        path = %path.display(),
                        "loaded persona from COLLOQUY_PERSONAS_DIR"
                    );
                    return Ok(persona);
                }
                Err(e) => {
                    tracing::warn!(
                        persona_id,
                        error = %e,
                        "COLLOQUY_PERSONAS_DIR set but persona not found, continuing"
                    );
                }
            }
        } else {
            tracing::warn!(
                path = %dir,
                "COLLOQUY_PERSONAS_DIR set but directory does not exist"
            );
        }
    }

    // 2. ~/.config/colloquy/personas
    if let Some(dir) = file::config_dir().map(|d| d.join("personas")) {
        match load_persona(&dir, persona_id) {
            Ok(persona) => {
                tracing::info!(persona_id, path = %dir.display(), "loaded persona");
                return Ok(persona);
            }
            Err(e) => {
                tracing::debug!(persona_id, error = %e, "no user persona, trying embedded");
            }
        }
    }

    // 3. Embedded fallback
    load_embedded_persona(persona_id)
}

/// Load a persona from file (JSON preferred, TOML fallback)
fn load_persona(personas_dir: &Path, persona_id: &str) -> Result<Persona> {
    let json_path = personas_dir.join(format!("{persona_id}.json"));
    if json_path.exists() {
        let content = std::fs::read_to_string(&json_path)?;
        let persona: Persona = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {persona_id}.json: {e}")))?;
        tracing::debug!(path = %json_path.display(), "loaded persona from JSON");
        return Ok(persona);
    }

    let toml_path = personas_dir.join(format!("{persona_id}.toml"));
    if toml_path.exists() {
        let content = std::fs::read_to_string(&toml_path)?;
        let persona: Persona = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {persona_id}.toml: {e}")))?;
        tracing::debug!(path = %toml_path.display(), "loaded persona from TOML");
        return Ok(persona);
    }

    Err(Error::PersonaNotFound(persona_id.to_string()))
}

/// Embedded persona data for when no local files are available
const EMBEDDED_PERSONAS: &[(&str, &str)] =
    &[("colloquy", include_str!("../../personas/colloquy.json"))];

/// Load an embedded persona compiled into the binary
///
/// # Errors
///
/// Returns error if persona ID is not found in embedded data
pub fn load_embedded_persona(persona_id: &str) -> Result<Persona> {
    EMBEDDED_PERSONAS
        .iter()
        .find(|(id, _)| *id == persona_id)
        .and_then(|(_, json)| {
            let persona: Persona = serde_json::from_str(json).ok()?;
            tracing::info!(persona_id, "loaded persona from embedded data");
            Some(persona)
        })
        .ok_or_else(|| Error::PersonaNotFound(persona_id.to_string()))
}
