//! Colloquy Live - duplex voice sessions with a remote conversational service
//!
//! This library provides the live session core:
//! - Microphone capture, framing and PCM encoding
//! - Gapless scheduling of streamed synthesized speech
//! - The WebSocket channel to the service
//! - A supervisor that reconnects after network loss
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐  frames   ┌───────────┐   JSON    ┌──────────────┐
//! │  Capture  │──────────▶│ Transport │◀─────────▶│ Live service │
//! │ Pipeline  │           └─────┬─────┘           └──────────────┘
//! └─────▲─────┘                 │ events
//!       │ mic                   ▼
//! ┌─────┴─────────────────────────────────┐
//! │          Session Supervisor           │──▶ status / volume / error
//! └─────────────────────┬─────────────────┘
//!                       │ chunks
//!               ┌───────▼───────┐
//!               │   Playback    │──▶ speakers
//!               │   Scheduler   │
//!               └───────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod persona;
pub mod session;
pub mod transport;

pub use audio::{AudioBackend, AudioFrame, CpalBackend, Direction, VolumeEnvelope};
pub use config::Config;
pub use error::{Error, Result};
pub use persona::Persona;
pub use session::{ConnectionStatus, SessionHandle, SessionOptions, SessionSnapshot, Supervisor};
pub use transport::{Connector, SessionConfig, TransportEvent, WebSocketConnector};
