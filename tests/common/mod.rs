//! Shared test utilities
//!
//! Virtual audio devices with a settable clock and a connector that plays
//! back a script of channel outcomes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use colloquy_live::audio::{
    AudioBackend, AudioFrame, ChunkId, InputDevice, OutputDevice, PlayableBuffer, SampleCallback,
};
use colloquy_live::transport::{Connector, Dialect, SessionConfig, TransportEvent, TransportLink};
use colloquy_live::{Error, Result, SessionOptions, SessionSnapshot};

/// Shared state of the virtual microphone
#[derive(Default)]
pub struct MicState {
    callback: Mutex<Option<SampleCallback>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub suspended: AtomicBool,
    pub resumed: AtomicUsize,
}

impl MicState {
    /// Deliver samples as if the device callback fired
    pub fn feed(&self, samples: &[f32]) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(samples);
        }
    }

    pub fn is_started(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

struct VirtualMic {
    rate: u32,
    state: Arc<MicState>,
}

impl InputDevice for VirtualMic {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn start(&mut self, on_samples: SampleCallback) -> Result<()> {
        *self.state.callback.lock().unwrap() = Some(on_samples);
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.state.suspended.load(Ordering::SeqCst)
    }

    fn resume(&mut self) {
        self.state.suspended.store(false, Ordering::SeqCst);
        self.state.resumed.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {
        *self.state.callback.lock().unwrap() = None;
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A chunk handed to the virtual speaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub id: ChunkId,
    pub start_time: f64,
    pub duration: f64,
}

/// Shared state of the virtual speaker
#[derive(Default)]
pub struct SpeakerState {
    pub now: Mutex<f64>,
    pub scheduled: Mutex<Vec<Scheduled>>,
    pub stopped: Mutex<Vec<ChunkId>>,
    pub keep_alive: AtomicBool,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub suspended: AtomicBool,
    pub resumed: AtomicUsize,
    completions: Mutex<Option<mpsc::UnboundedSender<ChunkId>>>,
}

impl SpeakerState {
    /// Move the device clock
    pub fn set_now(&self, now: f64) {
        *self.now.lock().unwrap() = now;
    }

    /// Report every chunk that was not stopped as finished
    pub fn finish_all(&self) {
        let stopped = self.stopped.lock().unwrap().clone();
        if let Some(tx) = self.completions.lock().unwrap().as_ref() {
            for chunk in self.scheduled.lock().unwrap().iter() {
                if !stopped.contains(&chunk.id) {
                    let _ = tx.send(chunk.id);
                }
            }
        }
    }

    pub fn scheduled(&self) -> Vec<Scheduled> {
        self.scheduled.lock().unwrap().clone()
    }
}

struct VirtualSpeaker {
    rate: u32,
    state: Arc<SpeakerState>,
}

impl OutputDevice for VirtualSpeaker {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn current_time(&self) -> f64 {
        *self.state.now.lock().unwrap()
    }

    fn schedule(&mut self, id: ChunkId, start_time: f64, buffer: PlayableBuffer) -> Result<()> {
        if buffer.sample_rate != self.rate {
            return Err(Error::Audio("rate mismatch".to_string()));
        }
        self.state.scheduled.lock().unwrap().push(Scheduled {
            id,
            start_time,
            duration: buffer.duration(),
        });
        Ok(())
    }

    fn stop(&mut self, id: ChunkId) {
        self.state.stopped.lock().unwrap().push(id);
    }

    fn set_keep_alive(&mut self, enabled: bool) {
        self.state.keep_alive.store(enabled, Ordering::SeqCst);
    }

    fn is_suspended(&self) -> bool {
        self.state.suspended.load(Ordering::SeqCst)
    }

    fn resume(&mut self) {
        self.state.suspended.store(false, Ordering::SeqCst);
        self.state.resumed.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// How the virtual microphone responds to being opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicAccess {
    Granted,
    Denied,
    Missing,
}

/// Backend of virtual devices sharing state with the test
pub struct VirtualBackend {
    pub mic: Arc<MicState>,
    pub speaker: Arc<SpeakerState>,
    pub mic_rate: u32,
    pub speaker_rate: u32,
    pub access: MicAccess,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self {
            mic: Arc::new(MicState::default()),
            speaker: Arc::new(SpeakerState::default()),
            mic_rate: 16_000,
            speaker_rate: 24_000,
            access: MicAccess::Granted,
        }
    }

    pub fn with_access(mut self, access: MicAccess) -> Self {
        self.access = access;
        self
    }
}

impl AudioBackend for VirtualBackend {
    fn has_capture_capability(&self) -> bool {
        self.access != MicAccess::Missing
    }

    fn open_input(&self) -> Result<Box<dyn InputDevice>> {
        if self.access == MicAccess::Denied {
            return Err(Error::Permission("denied by user".to_string()));
        }
        self.mic.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualMic {
            rate: self.mic_rate,
            state: Arc::clone(&self.mic),
        }))
    }

    fn open_output(
        &self,
        completions: mpsc::UnboundedSender<ChunkId>,
    ) -> Result<Box<dyn OutputDevice>> {
        self.speaker.opened.fetch_add(1, Ordering::SeqCst);
        *self.speaker.completions.lock().unwrap() = Some(completions);
        Ok(Box::new(VirtualSpeaker {
            rate: self.speaker_rate,
            state: Arc::clone(&self.speaker),
        }))
    }
}

/// Link that records outbound frames
#[derive(Default)]
pub struct RecordingLink {
    pub frames: Mutex<Vec<AudioFrame>>,
    pub closed: AtomicBool,
}

impl TransportLink for RecordingLink {
    fn send(&self, frame: AudioFrame) {
        self.frames.lock().unwrap().push(frame);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Outcome of one connection attempt
#[derive(Debug, Clone)]
pub enum Script {
    /// Channel opens normally
    Open,
    /// Channel construction fails with this reason
    Refuse(String),
    /// Channel drops with 1006 before it opens
    DropBeforeOpen,
}

/// One call to `open`
pub struct Attempt {
    pub at: Instant,
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub link: Arc<RecordingLink>,
}

/// Connector that follows a script; attempts beyond it open normally
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Script>>,
    attempts: Mutex<Vec<Attempt>>,
}

impl ScriptedConnector {
    pub fn new(script: impl IntoIterator<Item = Script>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|a| a.at).collect()
    }

    pub fn link(&self, attempt: usize) -> Arc<RecordingLink> {
        Arc::clone(&self.attempts.lock().unwrap()[attempt].link)
    }

    /// Inject an event on the channel of `attempt`
    pub fn emit(&self, attempt: usize, event: TransportEvent) {
        let _ = self.attempts.lock().unwrap()[attempt].events.send(event);
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        _config: &SessionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>> {
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Open);
        let link = Arc::new(RecordingLink::default());

        self.attempts.lock().unwrap().push(Attempt {
            at: Instant::now(),
            events: events.clone(),
            link: Arc::clone(&link),
        });

        match step {
            Script::Open => {
                let _ = events.send(TransportEvent::Opened);
            }
            Script::Refuse(reason) => return Err(Error::transport(reason)),
            Script::DropBeforeOpen => {
                let _ = events.send(TransportEvent::Closed {
                    code: 1006,
                    reason: String::new(),
                });
            }
        }

        Ok(link)
    }
}

/// Options pointing at a fake endpoint
pub fn test_options() -> SessionOptions {
    SessionOptions::new(SessionConfig {
        endpoint: "wss://live.example.test/session".to_string(),
        api_key: None,
        model: "test-model".to_string(),
        voice: "Fenrir".to_string(),
        system_instruction: "Be brief.".to_string(),
        dialect: Dialect::Media,
    })
}

/// Wait until the published state satisfies `predicate`
pub async fn wait_for<F>(state: &mut watch::Receiver<SessionSnapshot>, predicate: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), state.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("supervisor stopped")
        .clone()
}

/// Generate sine wave samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn sine(frequency: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}
