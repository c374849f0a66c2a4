//! Live session lifecycle
//!
//! A `Supervisor` task owns every device and channel of the session.
//! Callers hold a cloneable `SessionHandle` and observe a `SessionSnapshot`
//! published over a watch channel.

pub mod retry;
pub mod supervisor;

use std::fmt;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::audio::VolumeEnvelope;
use crate::audio::meter::SPEAKING_THRESHOLD;
use crate::{Error, Result};

pub use retry::RetryPolicy;
pub use supervisor::{SessionOptions, Supervisor};

/// Connection status shown to observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session
    #[default]
    Disconnected,
    /// Opening, or waiting to reconnect
    Connecting,
    /// Audio is flowing
    Connected,
    /// The session ended with a message for the user
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Observable session state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Connection status
    pub status: ConnectionStatus,
    /// Latest input and output levels
    pub volume: VolumeEnvelope,
    /// Message describing why the session ended, if it failed
    pub error_message: Option<String>,
}

impl SessionSnapshot {
    /// Whether the microphone is picking up speech
    #[must_use]
    pub fn is_user_speaking(&self) -> bool {
        self.volume.input > SPEAKING_THRESHOLD
    }

    /// Whether synthesized speech is playing
    #[must_use]
    pub fn is_ai_speaking(&self) -> bool {
        self.volume.output > SPEAKING_THRESHOLD
    }
}

pub(crate) enum Command {
    Connect { reply: oneshot::Sender<Result<()>> },
    Disconnect { done: oneshot::Sender<()> },
}

/// Cloneable handle to a running session supervisor
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub(crate) const fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        Self { commands, state }
    }

    /// Start a session
    ///
    /// Does nothing if a session is already connecting or connected.
    /// Returns once the devices are acquired and the channel is opening;
    /// channel failures are reported through the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Capability` if the platform cannot capture audio and
    /// `Error::Permission` if microphone access is denied
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// End the session and release every resource
    ///
    /// Cancels any pending reconnection. Safe to call in any state.
    pub async fn disconnect(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }
}

fn stopped() -> Error {
    Error::Transport("session supervisor stopped".to_string())
}
