//! Audio device seam
//!
//! The session only talks to hardware through these traits. The cpal
//! backend is the production implementation; tests plug in virtual devices.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{HostTrait, StreamTrait};
use tokio::sync::mpsc;

use super::capture::CpalInput;
use super::convert::PlayableBuffer;
use super::playback::CpalOutput;
use crate::{Error, Result};

/// Callback receiving mono microphone samples from the audio thread
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Identifier of a chunk handed to an output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u64);

/// Opens input and output devices for a session
pub trait AudioBackend: Send + Sync {
    /// Whether the platform can capture audio at all
    fn has_capture_capability(&self) -> bool;

    /// Acquire the microphone
    ///
    /// # Errors
    ///
    /// Returns `Error::Capability` when no input exists and
    /// `Error::Permission` when access is denied
    fn open_input(&self) -> Result<Box<dyn InputDevice>>;

    /// Acquire the output device
    ///
    /// Chunk ids are sent on `completions` once they finish playing.
    ///
    /// # Errors
    ///
    /// Returns error if no output device can be opened
    fn open_output(
        &self,
        completions: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn OutputDevice>>;
}

/// A microphone owned by the capture pipeline
pub trait InputDevice: Send {
    /// Native capture rate
    fn sample_rate(&self) -> u32;

    /// Begin delivering samples to `on_samples`
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be started
    fn start(&mut self, on_samples: SampleCallback) -> Result<()>;

    /// Whether the stream has stalled or been paused by the platform
    fn is_suspended(&self) -> bool;

    /// Ask a suspended stream to play again
    fn resume(&mut self);

    /// Release the device; safe to call more than once
    fn close(&mut self);
}

/// An output device owned by the playback scheduler
pub trait OutputDevice: Send {
    /// Native playback rate
    fn sample_rate(&self) -> u32;

    /// Device clock in seconds
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `start_time` on the device clock
    ///
    /// # Errors
    ///
    /// Returns error if the buffer does not match the device rate
    fn schedule(&mut self, id: ChunkId, start_time: f64, buffer: PlayableBuffer) -> Result<()>;

    /// Silence a scheduled chunk without reporting completion
    fn stop(&mut self, id: ChunkId);

    /// Mix the inaudible keep-alive tone into the output
    fn set_keep_alive(&mut self, enabled: bool);

    /// Whether the stream has stalled or been paused by the platform
    fn is_suspended(&self) -> bool;

    /// Ask a suspended stream to play again
    fn resume(&mut self);

    /// Release the device; safe to call more than once
    fn close(&mut self);
}

/// Backend using the host's default cpal devices
#[derive(Debug, Clone, Copy)]
pub struct CpalBackend {
    /// Microphone rate to request when the device supports it
    pub capture_rate: u32,
}

impl CpalBackend {
    /// Backend preferring `capture_rate` for the microphone
    #[must_use]
    pub const fn new(capture_rate: u32) -> Self {
        Self { capture_rate }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(super::convert::WIRE_INPUT_RATE)
    }
}

impl AudioBackend for CpalBackend {
    fn has_capture_capability(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn open_input(&self) -> Result<Box<dyn InputDevice>> {
        Ok(Box::new(CpalInput::open(self.capture_rate)?))
    }

    fn open_output(
        &self,
        completions: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(CpalOutput::open(completions)?))
    }
}

/// Map a cpal stream construction failure onto the session taxonomy
pub(crate) fn classify_build_error(err: &cpal::BuildStreamError) -> Error {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            Error::Capability("audio device not available".to_string())
        }
        other => classify_device_error(other.to_string()),
    }
}

/// Classify a device failure by its backend message
pub(crate) fn classify_device_error(text: String) -> Error {
    let lower = text.to_lowercase();
    if lower.contains("permission")
        || lower.contains("denied")
        || lower.contains("not allowed")
        || lower.contains("unauthorized")
    {
        Error::Permission(text)
    } else {
        Error::Audio(text)
    }
}

enum StreamControl {
    Resume,
    Stop,
}

/// Owns a cpal stream on a dedicated thread
///
/// cpal streams are not `Send`, so the stream is built and dropped on its own
/// thread and driven through a control channel.
pub(crate) struct StreamWorker {
    control: std_mpsc::Sender<StreamControl>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// Build and start a stream on a new thread, waiting for it to play
    ///
    /// # Errors
    ///
    /// Returns the build or play error reported by the thread
    pub(crate) fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (control_tx, control_rx) = std_mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream
                        .play()
                        .map_err(|e| Error::Audio(e.to_string()))
                        .map(|()| stream)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(msg) = control_rx.recv() {
                    match msg {
                        StreamControl::Resume => {
                            if let Err(e) = stream.play() {
                                tracing::warn!(error = %e, "failed to resume audio stream");
                            }
                        }
                        StreamControl::Stop => break,
                    }
                }

                drop(stream);
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio(format!("{name} thread exited before starting")))??;

        Ok(Self {
            control: control_tx,
            handle: Some(handle),
        })
    }

    pub(crate) fn resume(&self) {
        let _ = self.control.send(StreamControl::Resume);
    }

    /// Stop the stream and join its thread
    pub(crate) fn stop(&mut self) {
        let _ = self.control.send(StreamControl::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("audio stream thread panicked");
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
