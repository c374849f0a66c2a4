use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use colloquy_live::audio::capture::{CpalInput, samples_to_wav};
use colloquy_live::audio::convert::mean_abs_amplitude;
use colloquy_live::audio::playback::{CpalOutput, PlaybackScheduler};
use colloquy_live::audio::{InputDevice, PlayableBuffer, VolumeMeter};
use colloquy_live::{Config, ConnectionStatus, CpalBackend, Supervisor, WebSocketConnector};

/// Colloquy - live voice conversations from the terminal
#[derive(Parser)]
#[command(name = "colloquy", version, about)]
struct Cli {
    /// Persona to use (e.g., "colloquy")
    #[arg(short, long, env = "COLLOQUY_PERSONA")]
    persona: Option<String>,

    /// Live service WebSocket endpoint
    #[arg(long, env = "COLLOQUY_ENDPOINT")]
    endpoint: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the capture to a WAV file
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// Print the resolved configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,colloquy_live=info",
        1 => "info,colloquy_live=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, save } => test_mic(duration, save).await,
            Command::TestSpeaker => test_speaker().await,
            Command::ShowConfig => show_config(cli.persona.as_deref(), cli.endpoint),
        };
    }

    let config = load_config(cli.persona.as_deref(), cli.endpoint)?;
    tracing::debug!(?config, "loaded configuration");

    if config.api_key.is_none() {
        tracing::warn!("no API key configured, set COLLOQUY_API_KEY");
    }

    let handle = Supervisor::spawn(
        Arc::new(CpalBackend::new(config.audio.capture_rate)),
        Arc::new(WebSocketConnector::new()),
        config.session_options(),
    );

    tracing::info!(persona = config.persona.name(), "starting live session");
    if let Err(e) = handle.connect().await {
        anyhow::bail!(e.user_message());
    }

    let mut state = handle.subscribe();
    let mut meter = tokio::time::interval(Duration::from_secs(1));
    let mut last_status = ConnectionStatus::Disconnected;
    let mut was_active = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                handle.disconnect().await;
                return Ok(());
            }
            changed = state.changed() => {
                if changed.is_err() {
                    anyhow::bail!("session supervisor stopped");
                }
                let snapshot = state.borrow_and_update().clone();
                if snapshot.status != last_status {
                    tracing::info!(status = %snapshot.status, "session status changed");
                    last_status = snapshot.status;
                }
                match snapshot.status {
                    ConnectionStatus::Connecting | ConnectionStatus::Connected => was_active = true,
                    ConnectionStatus::Error => {
                        let message = snapshot.error_message.unwrap_or_default();
                        anyhow::bail!(message);
                    }
                    ConnectionStatus::Disconnected if was_active => {
                        tracing::info!("session ended");
                        return Ok(());
                    }
                    ConnectionStatus::Disconnected => {}
                }
            }
            _ = meter.tick() => {
                let snapshot = handle.snapshot();
                if snapshot.status == ConnectionStatus::Connected {
                    println!(
                        "mic {} | ai {}",
                        level_bar(snapshot.volume.input, 20),
                        level_bar(snapshot.volume.output, 20)
                    );
                }
            }
        }
    }
}

fn load_config(persona: Option<&str>, endpoint: Option<String>) -> anyhow::Result<Config> {
    Ok(Config::load_with_endpoint(persona, endpoint.as_deref())?)
}

/// Print resolved configuration with secrets redacted
fn show_config(persona: Option<&str>, endpoint: Option<String>) -> anyhow::Result<()> {
    let config = load_config(persona, endpoint)?;

    println!("persona:      {} ({})", config.persona.name(), config.persona.id());
    println!("endpoint:     {}", config.endpoint);
    println!(
        "api key:      {}",
        if config.api_key.is_some() { "[set]" } else { "[not set]" }
    );
    println!("model:        {}", config.model);
    println!("voice:        {}", config.voice);
    println!("dialect:      {}", config.dialect);
    println!("capture rate: {} Hz", config.audio.capture_rate);
    println!("frame:        {} ms", config.audio.frame_ms);
    println!("lead time:    {:?}", config.audio.lead_time);
    println!("keep-alive:   {}", config.audio.keep_alive);
    println!("heartbeat:    {:?}", config.audio.heartbeat);
    println!("display rate: {} Hz", config.audio.display_hz);
    println!(
        "retry:        {} attempts, {:?} base, {:?} cap",
        config.retry.max_attempts, config.retry.base_delay, config.retry.max_delay
    );

    if let Some(path) = colloquy_live::config::file::config_file_path() {
        println!("config file:  {}", path.display());
    }

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64, save: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = CpalInput::open(colloquy_live::audio::WIRE_INPUT_RATE)?;
    let sample_rate = capture.sample_rate();

    let window = Arc::new(Mutex::new(Vec::<f32>::new()));
    let recording = Arc::new(Mutex::new(Vec::<f32>::new()));
    {
        let window = Arc::clone(&window);
        let recording = Arc::clone(&recording);
        let keep = save.is_some();
        capture.start(Box::new(move |samples| {
            if let Ok(mut w) = window.lock() {
                w.extend_from_slice(samples);
            }
            if keep {
                if let Ok(mut r) = recording.lock() {
                    r.extend_from_slice(samples);
                }
            }
        }))?;
    }

    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = window
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        let level = mean_abs_amplitude(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        println!(
            "[{:2}s] Level: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            level,
            peak,
            level_bar(level * 10.0, 50)
        );
    }

    capture.close();

    if let Some(path) = save {
        let samples = recording.lock().map(|r| r.clone()).unwrap_or_default();
        let wav = samples_to_wav(&samples, sample_rate)?;
        std::fs::write(&path, wav)?;
        println!("\nSaved {} samples to {}", samples.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the level stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave through the playback scheduler
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let (completions_tx, mut completions) = mpsc::unbounded_channel();
    let output = CpalOutput::open(completions_tx)?;
    let mut scheduler = PlaybackScheduler::new(
        Box::new(output),
        Arc::new(VolumeMeter::new()),
        colloquy_live::audio::playback::DEFAULT_LEAD_TIME,
    );

    let sample_rate = scheduler.sample_rate();
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    let chunk = scheduler.schedule(PlayableBuffer {
        samples,
        sample_rate,
    })?;

    let finished = tokio::time::timeout(Duration::from_secs(5), completions.recv()).await;
    if let Ok(Some(id)) = finished {
        scheduler.complete(id);
    } else {
        tracing::warn!(chunk = chunk.id.0, "tone did not report completion");
    }
    scheduler.close();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Render a level in `[0, 1]` as a fixed-width bar
fn level_bar(level: f32, width: usize) -> String {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let filled = ((level.clamp(0.0, 1.0) * width as f32).round() as usize).min(width);
    "█".repeat(filled) + &" ".repeat(width - filled)
}
