//! Duplex channel to the live conversational service
//!
//! A `Connector` opens a channel and hands back a `TransportLink` for
//! outbound audio. Everything the service says comes back as a
//! `TransportEvent` on the events channel supplied to `open`.

pub mod protocol;
pub mod websocket;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;

use crate::Result;
use crate::audio::AudioFrame;

pub use protocol::{Dialect, InboundMessage};
pub use websocket::WebSocketConnector;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Closed without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Everything needed to open a session channel
#[derive(Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the service
    pub endpoint: String,
    /// Credential appended to the endpoint
    pub api_key: Option<SecretString>,
    /// Model identifier
    pub model: String,
    /// Synthesized voice name
    pub voice: String,
    /// Persona text sent as the system instruction
    pub system_instruction: String,
    /// Message framing spoken by the service
    pub dialect: Dialect,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("system_instruction_len", &self.system_instruction.len())
            .field("dialect", &self.dialect)
            .finish()
    }
}

/// Something the channel reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Ready for traffic
    Opened,
    /// A message from the service
    Message(InboundMessage),
    /// The channel closed
    Closed {
        /// WebSocket close code
        code: u16,
        /// Close reason, possibly empty
        reason: String,
    },
    /// Unrecoverable channel fault
    Error(String),
}

/// How a close code should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Deliberate close; no message
    Normal,
    /// Network loss; the only retry trigger
    Abnormal,
    /// Server-side disconnect with a code
    Other(u16),
}

/// Classify a close code
#[must_use]
pub const fn classify_close(code: u16) -> CloseKind {
    match code {
        CLOSE_NORMAL | CLOSE_NO_STATUS => CloseKind::Normal,
        CLOSE_ABNORMAL => CloseKind::Abnormal,
        other => CloseKind::Other(other),
    }
}

/// Outbound half of an open channel
pub trait TransportLink: Send + Sync {
    /// Queue a frame for sending; failures are dropped
    fn send(&self, frame: AudioFrame);

    /// Request a graceful close
    fn close(&self);
}

/// Opens session channels
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel and start delivering events
    ///
    /// `Opened` is sent on `events` once the channel is ready for audio.
    /// The connector never retries on its own.
    ///
    /// # Errors
    ///
    /// Returns `Error::Credential` if the service rejects the key and
    /// `Error::Transport` for any other construction failure
    async fn open(
        &self,
        config: &SessionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>>;
}
