//! Session supervisor
//!
//! A single task owns the microphone, the playback scheduler and the
//! channel. Commands, transport events, chunk completions and timers are
//! folded into one select loop, so no session field is shared.
//!
//! ```text
//!  Idle ──connect──▶ Connecting ──opened──▶ Live
//!                      ▲   │                 │
//!                 retry│   │fail        close│
//!                      │   ▼                 ▼
//!                   Retrying ◀──1006──── (classify) ──▶ Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::{Command, ConnectionStatus, RetryPolicy, SessionHandle, SessionSnapshot};
use crate::audio::capture::{CapturePipeline, FRAME_MS};
use crate::audio::convert::decode_pcm16;
use crate::audio::device::{AudioBackend, ChunkId, InputDevice};
use crate::audio::meter::VolumeMeter;
use crate::audio::playback::{DEFAULT_LEAD_TIME, PlaybackScheduler};
use crate::audio::AudioFrame;
use crate::error::is_credential_failure;
use crate::transport::{
    CLOSE_ABNORMAL, CloseKind, Connector, InboundMessage, SessionConfig, TransportEvent,
    TransportLink, classify_close,
};
use crate::{Error, Result};

/// Shown when reconnection gives up after repeated network loss
pub const CONNECTION_LOST: &str = "Connection lost. Please check your internet connection.";

/// Shown when the channel faults without a reason
pub const CONNECTION_ERROR: &str = "Connection error. Please try again.";

/// Shortest heartbeat or display period the loop will tick at
const MIN_TICK: Duration = Duration::from_millis(1);

/// Tunables for a supervised session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Channel parameters
    pub session: SessionConfig,
    /// Reconnection policy
    pub retry: RetryPolicy,
    /// Capture frame length in milliseconds
    pub frame_ms: u32,
    /// Playback lead time after the timeline falls behind
    pub lead_time: Duration,
    /// Mix the inaudible keep-alive tone while live
    pub keep_alive: bool,
    /// Interval at which suspended devices are resumed
    pub heartbeat: Duration,
    /// Interval at which volume levels are published
    pub display_interval: Duration,
}

impl SessionOptions {
    /// Options with default timing for `session`
    #[must_use]
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            retry: RetryPolicy::default(),
            frame_ms: FRAME_MS,
            lead_time: Duration::from_secs_f64(DEFAULT_LEAD_TIME),
            keep_alive: true,
            heartbeat: Duration::from_secs(1),
            display_interval: Duration::from_secs(1) / 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Live,
    Retrying,
    Failed,
}

type OpenResult = Result<Arc<dyn TransportLink>>;

enum Wake {
    Command(Command),
    HandlesDropped,
    ChannelOpened(OpenResult),
    Transport(TransportEvent),
    TransportGone,
    ChunkEnded(ChunkId),
    RetryDue,
    Heartbeat,
    Display,
}

/// Owns and drives one live session
pub struct Supervisor {
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    meter: Arc<VolumeMeter>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SessionSnapshot>,

    phase: Phase,
    error_message: Option<String>,
    retry_count: u32,
    should_retry: bool,
    retry_at: Option<Instant>,
    channel_open: bool,

    input: Option<Box<dyn InputDevice>>,
    playback: Option<PlaybackScheduler>,
    completions: Option<mpsc::UnboundedReceiver<ChunkId>>,
    link: Option<Arc<dyn TransportLink>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pending_open: Option<oneshot::Receiver<OpenResult>>,
}

impl Supervisor {
    /// Create a supervisor and the handle that controls it
    ///
    /// The supervisor does nothing until `run` is polled.
    #[must_use]
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());

        let supervisor = Self {
            backend,
            connector,
            options,
            meter: Arc::new(VolumeMeter::new()),
            commands: command_rx,
            state: state_tx,
            phase: Phase::Idle,
            error_message: None,
            retry_count: 0,
            should_retry: false,
            retry_at: None,
            channel_open: false,
            input: None,
            playback: None,
            completions: None,
            link: None,
            events: None,
            pending_open: None,
        };

        (supervisor, SessionHandle::new(command_tx, state_rx))
    }

    /// Spawn a supervisor on the current runtime
    #[must_use]
    pub fn spawn(
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> SessionHandle {
        let (supervisor, handle) = Self::new(backend, connector, options);
        tokio::spawn(supervisor.run());
        handle
    }

    /// Process commands and events until every handle is dropped
    pub async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.options.heartbeat.max(MIN_TICK));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut display = tokio::time::interval(self.options.display_interval.max(MIN_TICK));
        display.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let live = self.phase == Phase::Live;
            let retry_at = self.retry_at;

            let wake = tokio::select! {
                command = self.commands.recv() => {
                    command.map_or(Wake::HandlesDropped, Wake::Command)
                }
                result = await_open(&mut self.pending_open) => Wake::ChannelOpened(result),
                event = recv_or_pending(&mut self.events) => {
                    event.map_or(Wake::TransportGone, Wake::Transport)
                }
                Some(id) = recv_or_pending(&mut self.completions) => Wake::ChunkEnded(id),
                () = sleep_or_pending(retry_at) => Wake::RetryDue,
                _ = heartbeat.tick(), if live => Wake::Heartbeat,
                _ = display.tick(), if live => Wake::Display,
            };

            if !self.dispatch(wake) {
                break;
            }
        }

        tracing::debug!("session supervisor stopped");
    }

    fn dispatch(&mut self, wake: Wake) -> bool {
        match wake {
            Wake::Command(Command::Connect { reply }) => {
                let _ = reply.send(self.connect());
            }
            Wake::Command(Command::Disconnect { done }) => {
                self.disconnect();
                let _ = done.send(());
            }
            Wake::HandlesDropped => {
                self.disconnect();
                return false;
            }
            Wake::ChannelOpened(result) => self.on_channel_result(result),
            Wake::Transport(event) => self.on_transport_event(event),
            Wake::TransportGone => {
                self.events = None;
                if self.phase == Phase::Live {
                    self.on_closed(CLOSE_ABNORMAL, "");
                }
            }
            Wake::ChunkEnded(id) => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.complete(id);
                }
            }
            Wake::RetryDue => self.on_retry_due(),
            Wake::Heartbeat => self.heartbeat(),
            Wake::Display => self.publish(),
        }
        true
    }

    fn connect(&mut self) -> Result<()> {
        if matches!(
            self.phase,
            Phase::Connecting | Phase::Live | Phase::Retrying
        ) {
            tracing::debug!(phase = ?self.phase, "connect ignored, session already active");
            return Ok(());
        }

        self.error_message = None;
        self.retry_count = 0;
        self.should_retry = true;
        tracing::info!("starting live session");

        self.start_attempt()
    }

    fn disconnect(&mut self) {
        // Clear retry intent before anything can observe the closure
        self.should_retry = false;
        self.retry_at = None;
        self.teardown();

        if self.phase != Phase::Idle {
            tracing::info!("live session disconnected");
        }
        self.phase = Phase::Idle;
        self.publish();
    }

    fn start_attempt(&mut self) -> Result<()> {
        if !self.backend.has_capture_capability() {
            let err = Error::Capability("no audio input available".to_string());
            tracing::error!(error = %err, "cannot start session");
            self.should_retry = false;
            self.error_message = Some(err.user_message());
            self.phase = Phase::Idle;
            self.publish();
            return Err(err);
        }

        self.phase = Phase::Connecting;
        self.channel_open = false;
        self.publish();

        if let Err(e) = self.open_devices() {
            tracing::error!(error = %e, "failed to acquire audio devices");
            self.fail(e.user_message());
            return Err(e);
        }

        self.open_channel();
        Ok(())
    }

    fn open_devices(&mut self) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        self.input = Some(run_blocking(|| backend.open_input())?);

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let output = run_blocking(|| backend.open_output(completions_tx))?;
        self.completions = Some(completions_rx);
        self.playback = Some(PlaybackScheduler::new(
            output,
            Arc::clone(&self.meter),
            self.options.lead_time.as_secs_f64(),
        ));

        Ok(())
    }

    fn open_channel(&mut self) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let connector = Arc::clone(&self.connector);
        let config = self.options.session.clone();

        tokio::spawn(async move {
            let result = connector.open(&config, events_tx).await;
            if let Err(Ok(link)) = result_tx.send(result) {
                // Attempt abandoned while opening
                link.close();
            }
        });

        self.events = Some(events_rx);
        self.pending_open = Some(result_rx);
    }

    fn on_channel_result(&mut self, result: OpenResult) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.go_live_if_ready();
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = self.retry_count, "session channel failed to open");
                self.teardown();
                if e.is_retryable() && self.should_retry && self.options.retry.allows(self.retry_count)
                {
                    self.schedule_retry();
                } else {
                    self.fail(e.user_message());
                }
            }
        }
    }

    fn go_live_if_ready(&mut self) {
        if self.phase != Phase::Connecting || !self.channel_open {
            return;
        }
        let Some(link) = self.link.clone() else {
            return;
        };
        let Some(input) = self.input.as_mut() else {
            return;
        };

        let started = CapturePipeline::new(
            input.sample_rate(),
            self.options.frame_ms,
            Arc::clone(&self.meter),
            link,
        )
        .and_then(|pipeline| input.start(pipeline.into_callback()));
        if let Err(e) = started {
            tracing::error!(error = %e, "failed to start capture");
            self.fail(e.user_message());
            return;
        }

        if self.options.keep_alive {
            if let Some(playback) = self.playback.as_mut() {
                playback.set_keep_alive(true);
            }
        }

        self.phase = Phase::Live;
        self.retry_count = 0;
        tracing::info!("live session connected");
        self.publish();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.channel_open = true;
                self.go_live_if_ready();
            }
            TransportEvent::Message(InboundMessage::Interrupted) => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.interrupt();
                }
            }
            TransportEvent::Message(InboundMessage::Audio(frame)) => self.play(&frame),
            TransportEvent::Closed { code, reason } => self.on_closed(code, &reason),
            TransportEvent::Error(reason) => {
                tracing::error!(reason = %reason, "session channel error");
                let message = if reason.trim().is_empty() {
                    CONNECTION_ERROR.to_string()
                } else if is_credential_failure(&reason) {
                    Error::Credential(reason).user_message()
                } else {
                    reason
                };
                self.fail(message);
            }
        }
    }

    fn play(&mut self, frame: &AudioFrame) {
        let Some(playback) = self.playback.as_mut() else {
            return;
        };

        let buffer = match decode_pcm16(&frame.pcm, frame.sample_rate, 1, playback.sample_rate()) {
            Ok(buffer) if buffer.is_empty() => return,
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable audio chunk");
                return;
            }
        };

        if let Err(e) = playback.schedule(buffer) {
            tracing::warn!(error = %e, "failed to schedule audio chunk");
        }
    }

    fn on_closed(&mut self, code: u16, reason: &str) {
        self.teardown();

        match classify_close(code) {
            CloseKind::Abnormal
                if self.should_retry && self.options.retry.allows(self.retry_count) =>
            {
                self.schedule_retry();
            }
            CloseKind::Abnormal => self.fail(CONNECTION_LOST.to_string()),
            CloseKind::Normal => {
                tracing::info!(code, "live session closed");
                self.should_retry = false;
                self.error_message = None;
                self.phase = Phase::Failed;
                self.publish();
            }
            CloseKind::Other(code) => {
                let message = if is_credential_failure(reason) {
                    Error::Credential(reason.to_string()).user_message()
                } else {
                    format!("Session disconnected. Code: {code}.")
                };
                self.fail(message);
            }
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.options.retry.delay_for_attempt(self.retry_count);
        self.retry_count += 1;
        self.retry_at = Some(Instant::now() + delay);
        self.phase = Phase::Retrying;

        tracing::warn!(
            attempt = self.retry_count,
            max_attempts = self.options.retry.max_attempts,
            ?delay,
            "session channel lost, reconnecting"
        );
        self.publish();
    }

    fn on_retry_due(&mut self) {
        self.retry_at = None;
        if !self.should_retry || self.phase != Phase::Retrying {
            return;
        }
        if let Err(e) = self.start_attempt() {
            tracing::debug!(error = %e, "reconnection attempt failed");
        }
    }

    fn fail(&mut self, message: String) {
        self.teardown();
        self.should_retry = false;
        self.retry_at = None;
        tracing::error!(message = %message, "live session failed");
        self.error_message = Some(message);
        self.phase = Phase::Failed;
        self.publish();
    }

    fn heartbeat(&mut self) {
        if let Some(input) = self.input.as_mut() {
            if input.is_suspended() {
                tracing::debug!("resuming suspended input device");
                input.resume();
            }
        }
        if let Some(playback) = self.playback.as_mut() {
            playback.resume_if_suspended();
        }
    }

    /// Release every session resource; tolerates partial initialization
    fn teardown(&mut self) {
        self.pending_open = None;
        self.events = None;
        self.channel_open = false;

        if let Some(mut input) = self.input.take() {
            run_blocking(|| input.close());
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(mut playback) = self.playback.take() {
            run_blocking(|| playback.close());
        }
        self.completions = None;
        self.meter.reset();
    }

    const fn status(&self) -> ConnectionStatus {
        match self.phase {
            Phase::Idle => ConnectionStatus::Disconnected,
            Phase::Connecting | Phase::Retrying => ConnectionStatus::Connecting,
            Phase::Live => ConnectionStatus::Connected,
            Phase::Failed if self.error_message.is_some() => ConnectionStatus::Error,
            Phase::Failed => ConnectionStatus::Disconnected,
        }
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            status: self.status(),
            volume: self.meter.snapshot(),
            error_message: self.error_message.clone(),
        };
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Run a call that may block on an audio thread handshake
///
/// On a multi-threaded runtime the worker is handed off first so other tasks
/// keep running. Elsewhere the call runs inline.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

async fn await_open(pending: &mut Option<oneshot::Receiver<OpenResult>>) -> OpenResult {
    let Some(rx) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let result = rx
        .await
        .unwrap_or_else(|_| Err(Error::Transport(String::new())));
    *pending = None;
    result
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
