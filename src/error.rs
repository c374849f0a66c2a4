//! Error types for Colloquy live sessions

use thiserror::Error;

/// Result type alias for Colloquy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a live session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Persona not found
    #[error("persona not found: {0}")]
    PersonaNotFound(String),

    /// Platform lacks the audio APIs a session needs
    #[error("audio capability unavailable: {0}")]
    Capability(String),

    /// Microphone access was denied
    #[error("microphone permission denied: {0}")]
    Permission(String),

    /// Audio device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Channel construction or transport-level fault
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote service rejected the credential
    #[error("credential rejected: {0}")]
    Credential(String),

    /// Malformed wire message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Build a transport error, promoting it to a credential error when the
    /// failure reason names the API key
    pub fn transport(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if is_credential_failure(&reason) {
            Self::Credential(reason)
        } else {
            Self::Transport(reason)
        }
    }

    /// Message shown to the user when this error ends a session
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Capability(_) => {
                "Your system does not support audio recording.".to_string()
            }
            Self::Permission(_) => "Microphone access blocked.".to_string(),
            Self::Credential(_) => "Invalid API key.".to_string(),
            Self::Transport(reason) if reason.trim().is_empty() => {
                "Unable to connect to service.".to_string()
            }
            Self::Transport(reason) => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Whether a failed connection attempt may be retried
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

/// Check a failure reason for the marker the service uses for bad keys
#[must_use]
pub fn is_credential_failure(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("api key") || lower.contains("api_key")
}
