//! Session supervisor integration tests
//!
//! Drives full sessions against virtual devices and a scripted channel.
//! Time is paused so reconnection delays can be asserted exactly.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use colloquy_live::audio::{AudioFrame, Direction};
use colloquy_live::session::supervisor::CONNECTION_LOST;
use colloquy_live::transport::{InboundMessage, TransportEvent};
use colloquy_live::{AudioBackend, Connector, ConnectionStatus, Error, SessionHandle, Supervisor};

mod common;

use common::{MicAccess, Script, ScriptedConnector, VirtualBackend, sine, test_options, wait_for};

fn start(
    backend: VirtualBackend,
    connector: ScriptedConnector,
) -> (SessionHandle, Arc<VirtualBackend>, Arc<ScriptedConnector>) {
    let backend = Arc::new(backend);
    let connector = Arc::new(connector);
    let devices: Arc<dyn AudioBackend> = backend.clone();
    let channel: Arc<dyn Connector> = connector.clone();
    let handle = Supervisor::spawn(devices, channel, test_options());
    (handle, backend, connector)
}

async fn connected(handle: &SessionHandle) {
    handle.connect().await.unwrap();
    let mut state = handle.subscribe();
    wait_for(&mut state, |s| s.status == ConnectionStatus::Connected).await;
}

fn closed(code: u16) -> TransportEvent {
    TransportEvent::Closed {
        code,
        reason: String::new(),
    }
}

fn silent_reply(samples: usize) -> TransportEvent {
    TransportEvent::Message(InboundMessage::Audio(AudioFrame {
        direction: Direction::Inbound,
        sample_rate: 24_000,
        pcm: vec![0; samples * 2],
    }))
}

#[tokio::test(start_paused = true)]
async fn test_connect_goes_live_and_starts_capture() {
    let (handle, backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());

    connected(&handle).await;

    assert_eq!(connector.attempt_count(), 1);
    assert!(backend.mic.is_started());
    assert!(backend.speaker.keep_alive.load(Ordering::SeqCst));
    assert_eq!(handle.snapshot().error_message, None);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_is_noop() {
    let (handle, backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());

    connected(&handle).await;
    handle.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(backend.mic.opened.load(Ordering::SeqCst), 1);
    assert_eq!(handle.snapshot().status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_closures_retry_with_backoff_then_fail() {
    let script = vec![
        Script::Open,
        Script::DropBeforeOpen,
        Script::DropBeforeOpen,
        Script::DropBeforeOpen,
    ];
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::new(script));
    connected(&handle).await;

    let dropped_at = Instant::now();
    connector.emit(0, closed(1006));

    let mut state = handle.subscribe();
    let snapshot = wait_for(&mut state, |s| s.status == ConnectionStatus::Error).await;
    assert_eq!(snapshot.error_message.as_deref(), Some(CONNECTION_LOST));

    let times = connector.attempt_times();
    assert_eq!(times.len(), 4, "initial attempt plus three retries");
    assert_eq!(times[1] - dropped_at, Duration::from_millis(1000));
    assert_eq!(times[2] - times[1], Duration::from_millis(2000));
    assert_eq!(times[3] - times[2], Duration::from_millis(4000));

    // Nothing further is scheduled
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempt_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_status_stays_connecting_while_retrying() {
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    connector.emit(0, closed(1006));
    let mut state = handle.subscribe();
    let snapshot = wait_for(&mut state, |s| s.status != ConnectionStatus::Connected).await;
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert_eq!(snapshot.error_message, None);

    // Retry opens normally and resets the counter
    wait_for(&mut state, |s| s.status == ConnectionStatus::Connected).await;
    assert_eq!(connector.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_retry() {
    let (handle, backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    connector.emit(0, closed(1006));
    let mut state = handle.subscribe();
    wait_for(&mut state, |s| s.status == ConnectionStatus::Connecting).await;

    handle.disconnect().await;
    assert_eq!(handle.snapshot().status, ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(handle.snapshot().status, ConnectionStatus::Disconnected);
    assert!(!backend.mic.is_started());
}

#[tokio::test(start_paused = true)]
async fn test_normal_close_ends_without_message() {
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    connector.emit(0, closed(1000));
    let mut state = handle.subscribe();
    let snapshot = wait_for(&mut state, |s| s.status == ConnectionStatus::Disconnected).await;

    assert_eq!(snapshot.error_message, None);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_other_close_code_surfaces_message() {
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    connector.emit(0, closed(1011));
    let mut state = handle.subscribe();
    let snapshot = wait_for(&mut state, |s| s.status == ConnectionStatus::Error).await;

    assert_eq!(
        snapshot.error_message.as_deref(),
        Some("Session disconnected. Code: 1011.")
    );
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_channel_error_uses_reason_or_fallback() {
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    connector.emit(0, TransportEvent::Error(String::new()));
    let mut state = handle.subscribe();
    let snapshot = wait_for(&mut state, |s| s.status == ConnectionStatus::Error).await;
    assert_eq!(
        snapshot.error_message.as_deref(),
        Some("Connection error. Please try again.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_key_is_not_retried() {
    let script = vec![Script::Refuse("API key not valid".to_string())];
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::new(script));

    handle.connect().await.unwrap();
    let mut state = handle.subscribe();
    let snapshot = wait_for(&mut state, |s| s.status == ConnectionStatus::Error).await;

    assert_eq!(snapshot.error_message.as_deref(), Some("Invalid API key."));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_with_key_reason_surfaces_credential_message() {
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    connector.emit(
        0,
        TransportEvent::Closed {
            code: 1008,
            reason: "API key not valid. Please pass a valid API key.".to_string(),
        },
    );
    let mut state = handle.subscribe();
    let snapshot = wait_for(&mut state, |s| s.status == ConnectionStatus::Error).await;

    assert_eq!(snapshot.error_message.as_deref(), Some("Invalid API key."));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_channel_error_with_key_reason_surfaces_credential_message() {
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    connector.emit(0, TransportEvent::Error("API_KEY_INVALID".to_string()));
    let mut state = handle.subscribe();
    let snapshot = wait_for(&mut state, |s| s.status == ConnectionStatus::Error).await;

    assert_eq!(snapshot.error_message.as_deref(), Some("Invalid API key."));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timer_intervals_do_not_stop_the_session() {
    let backend: Arc<dyn AudioBackend> = Arc::new(VirtualBackend::new());
    let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::default());
    let mut options = test_options();
    options.display_interval = Duration::ZERO;
    options.heartbeat = Duration::ZERO;

    let handle = Supervisor::spawn(backend, connector, options);
    connected(&handle).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.snapshot().status, ConnectionStatus::Connected);
    handle.disconnect().await;
    assert_eq!(handle.snapshot().status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_open_is_retried() {
    let script = vec![Script::Refuse("connection refused".to_string())];
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::new(script));

    handle.connect().await.unwrap();
    let mut state = handle.subscribe();
    wait_for(&mut state, |s| s.status == ConnectionStatus::Connected).await;

    let times = connector.attempt_times();
    assert_eq!(times.len(), 2);
    assert_eq!(times[1] - times[0], Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_missing_capture_capability() {
    let backend = VirtualBackend::new().with_access(MicAccess::Missing);
    let (handle, _backend, connector) = start(backend, ScriptedConnector::default());

    let err = handle.connect().await.unwrap_err();
    assert!(matches!(err, Error::Capability(_)));

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(
        snapshot.error_message.as_deref(),
        Some("Your system does not support audio recording.")
    );
    assert_eq!(connector.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone() {
    let backend = VirtualBackend::new().with_access(MicAccess::Denied);
    let (handle, _backend, connector) = start(backend, ScriptedConnector::default());

    let err = handle.connect().await.unwrap_err();
    assert!(matches!(err, Error::Permission(_)));

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Error);
    assert_eq!(snapshot.error_message.as_deref(), Some("Microphone access blocked."));
    assert_eq!(connector.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_clears_previous_error() {
    let (handle, _backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    connector.emit(0, closed(4000));
    let mut state = handle.subscribe();
    wait_for(&mut state, |s| s.status == ConnectionStatus::Error).await;

    handle.connect().await.unwrap();
    let snapshot = wait_for(&mut state, |s| s.status == ConnectionStatus::Connected).await;
    assert_eq!(snapshot.error_message, None);
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_audio() {
    let (handle, backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;
    let mut state = handle.subscribe();

    // One 128 ms frame of speech from the microphone
    let fed_at = Instant::now();
    backend.mic.feed(&sine(440.0, 16_000, 2048, 0.5));
    let snapshot = wait_for(&mut state, |s| s.volume.input > 0.01).await;
    assert!(snapshot.is_user_speaking());
    assert!(Instant::now() - fed_at <= Duration::from_millis(128));

    let frames = connector.link(0).frames.lock().unwrap().clone();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].direction, Direction::Outbound);
    assert_eq!(frames[0].sample_rate, 16_000);
    assert_eq!(frames[0].pcm.len(), 2048 * 2);

    // 100 ms of silence back from the service
    backend.speaker.set_now(3.0);
    connector.emit(0, silent_reply(2400));
    let snapshot = wait_for(&mut state, |s| s.volume.output > 0.0).await;
    assert!(snapshot.is_ai_speaking());

    let scheduled = backend.speaker.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert!((scheduled[0].duration - 0.1).abs() < 1e-6);
    assert!((scheduled[0].start_time - 3.05).abs() < 1e-9);

    backend.speaker.finish_all();
    let snapshot = wait_for(&mut state, |s| s.volume.output < f32::EPSILON).await;
    assert!(!snapshot.is_ai_speaking());
}

#[tokio::test(start_paused = true)]
async fn test_replies_play_back_to_back() {
    let (handle, backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    backend.speaker.set_now(1.0);
    for samples in [2400, 4800, 1200] {
        connector.emit(0, silent_reply(samples));
    }

    let mut state = handle.subscribe();
    wait_for(&mut state, |s| s.volume.output > 0.0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let scheduled = backend.speaker.scheduled();
    assert_eq!(scheduled.len(), 3);
    for pair in scheduled.windows(2) {
        let end = pair[0].start_time + pair[0].duration;
        assert!((pair[1].start_time - end).abs() < 1e-9);
    }
}

#[tokio::test(start_paused = true)]
async fn test_interruption_stops_playback() {
    let (handle, backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    backend.speaker.set_now(2.0);
    for _ in 0..3 {
        connector.emit(0, silent_reply(12_000));
    }
    let mut state = handle.subscribe();
    wait_for(&mut state, |s| s.volume.output > 0.0).await;

    connector.emit(0, TransportEvent::Message(InboundMessage::Interrupted));
    wait_for(&mut state, |s| s.volume.output < f32::EPSILON).await;
    assert_eq!(backend.speaker.stopped.lock().unwrap().len(), 3);

    backend.speaker.set_now(2.2);
    connector.emit(0, silent_reply(2400));
    wait_for(&mut state, |s| s.volume.output > 0.0).await;

    let scheduled = backend.speaker.scheduled();
    assert_eq!(scheduled.len(), 4);
    assert!((scheduled[3].start_time - 2.25).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_resumes_suspended_devices() {
    let (handle, backend, _connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;

    backend.mic.suspended.store(true, Ordering::SeqCst);
    backend.speaker.suspended.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(backend.mic.resumed.load(Ordering::SeqCst) >= 1);
    assert!(backend.speaker.resumed.load(Ordering::SeqCst) >= 1);
    assert!(!backend.mic.suspended.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_twice_releases_everything_once() {
    let (handle, backend, connector) = start(VirtualBackend::new(), ScriptedConnector::default());
    connected(&handle).await;
    backend.mic.feed(&sine(440.0, 16_000, 2048, 0.5));

    handle.disconnect().await;
    handle.disconnect().await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(snapshot.volume.input < f32::EPSILON);
    assert!(snapshot.volume.output < f32::EPSILON);
    assert_eq!(backend.mic.closed.load(Ordering::SeqCst), 1);
    assert_eq!(backend.speaker.closed.load(Ordering::SeqCst), 1);
    assert!(!backend.speaker.keep_alive.load(Ordering::SeqCst));
    assert!(connector.link(0).closed.load(Ordering::SeqCst));
}
