//! Audio playback to speakers
//!
//! `PlaybackScheduler` lays inbound chunks end to end on the device clock.
//! `CpalOutput` renders that timeline through a single mixing stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use super::convert::{PlayableBuffer, WIRE_OUTPUT_RATE};
use super::device::{ChunkId, OutputDevice, StreamWorker, classify_build_error};
use super::meter::{OUTPUT_ACTIVE_LEVEL, VolumeMeter};
use crate::{Error, Result};

/// Sample rate for playback (matches the inbound wire rate)
pub const PLAYBACK_SAMPLE_RATE: u32 = WIRE_OUTPUT_RATE;

/// Lead time added when the timeline has fallen behind the device clock
pub const DEFAULT_LEAD_TIME: f64 = 0.05;

/// Keep-alive tone frequency
const KEEP_ALIVE_HZ: f32 = 440.0;

/// Keep-alive tone amplitude (inaudible)
const KEEP_ALIVE_GAIN: f32 = 0.0001;

/// A chunk placed on the playback timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    /// Device-assigned identifier
    pub id: ChunkId,
    /// Start on the device clock, in seconds
    pub start_time: f64,
    /// Length in seconds
    pub duration: f64,
}

impl ScheduledChunk {
    /// Device time at which the chunk finishes
    #[must_use]
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Schedules decoded chunks back to back on the output device
pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    meter: Arc<VolumeMeter>,
    lead_time: f64,
    next_start_time: f64,
    next_id: u64,
    active: BTreeMap<ChunkId, ScheduledChunk>,
    closed: bool,
}

impl PlaybackScheduler {
    /// Create a scheduler that owns `device`
    #[must_use]
    pub fn new(device: Box<dyn OutputDevice>, meter: Arc<VolumeMeter>, lead_time: f64) -> Self {
        Self {
            device,
            meter,
            lead_time,
            next_start_time: 0.0,
            next_id: 0,
            active: BTreeMap::new(),
            closed: false,
        }
    }

    /// Native rate of the output device
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.device.sample_rate()
    }

    /// Where the next chunk will start if it arrives in time
    #[must_use]
    pub const fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Number of chunks scheduled and not yet finished
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Chunks scheduled and not yet finished, in scheduling order
    pub fn active_chunks(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.active.values()
    }

    /// Queue a chunk after everything already scheduled
    ///
    /// If the timeline has fallen behind the device clock it is moved to
    /// `now + lead_time` first.
    ///
    /// # Errors
    ///
    /// Returns error if the scheduler is closed or the device rejects the chunk
    pub fn schedule(&mut self, buffer: PlayableBuffer) -> Result<ScheduledChunk> {
        if self.closed {
            return Err(Error::Audio("playback scheduler is closed".to_string()));
        }

        let now = self.device.current_time();
        if self.next_start_time < now {
            self.next_start_time = now + self.lead_time;
        }

        let id = ChunkId(self.next_id);
        self.next_id += 1;

        let chunk = ScheduledChunk {
            id,
            start_time: self.next_start_time,
            duration: buffer.duration(),
        };

        self.device.schedule(id, chunk.start_time, buffer)?;

        self.next_start_time += chunk.duration;
        self.active.insert(id, chunk);
        self.meter.set_output(OUTPUT_ACTIVE_LEVEL);

        tracing::trace!(
            chunk = id.0,
            start = chunk.start_time,
            duration = chunk.duration,
            queued = self.active.len(),
            "chunk scheduled"
        );

        Ok(chunk)
    }

    /// Deregister a chunk that finished playing
    pub fn complete(&mut self, id: ChunkId) {
        if self.active.remove(&id).is_some() && self.active.is_empty() {
            self.meter.set_output(0.0);
        }
    }

    /// Stop everything immediately and restart the timeline
    pub fn interrupt(&mut self) {
        let stopped = self.active.len();
        for id in self.active.keys() {
            self.device.stop(*id);
        }
        self.active.clear();
        self.next_start_time = 0.0;
        self.meter.set_output(0.0);

        tracing::debug!(stopped, "playback interrupted");
    }

    /// Start or stop the inaudible keep-alive tone
    pub fn set_keep_alive(&mut self, enabled: bool) {
        if !self.closed {
            self.device.set_keep_alive(enabled);
        }
    }

    /// Resume the output stream if the platform suspended it
    pub fn resume_if_suspended(&mut self) {
        if !self.closed && self.device.is_suspended() {
            tracing::debug!("resuming suspended output device");
            self.device.resume();
        }
    }

    /// Stop all playback and release the device; safe to call repeatedly
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.device.set_keep_alive(false);
        self.interrupt();
        self.device.close();
        self.closed = true;
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

struct Voice {
    id: ChunkId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled chunks and the keep-alive tone into device buffers
struct Mixer {
    sample_rate: u32,
    voices: Vec<Voice>,
    keep_alive: bool,
    tone_phase: f32,
    completions: mpsc::UnboundedSender<ChunkId>,
}

impl Mixer {
    fn new(sample_rate: u32, completions: mpsc::UnboundedSender<ChunkId>) -> Self {
        Self {
            sample_rate,
            voices: Vec::new(),
            keep_alive: false,
            tone_phase: 0.0,
            completions,
        }
    }

    /// Fill `data` with frames starting at absolute frame `first_frame`
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn render(&mut self, data: &mut [f32], channels: usize, first_frame: u64) {
        let step = KEEP_ALIVE_HZ / self.sample_rate as f32;
        let mut frame_index = first_frame;

        for frame in data.chunks_mut(channels) {
            let mut sample = 0.0;
            for voice in &self.voices {
                if frame_index >= voice.start_frame && frame_index < voice.end_frame() {
                    sample += voice.samples[(frame_index - voice.start_frame) as usize];
                }
            }

            if self.keep_alive {
                sample += KEEP_ALIVE_GAIN * (std::f32::consts::TAU * self.tone_phase).sin();
                self.tone_phase = (self.tone_phase + step).fract();
            }

            let sample = sample.clamp(-1.0, 1.0);
            for out in frame.iter_mut() {
                *out = sample;
            }
            frame_index += 1;
        }

        let completions = &self.completions;
        self.voices.retain(|voice| {
            let done = voice.end_frame() <= frame_index;
            if done {
                let _ = completions.send(voice.id);
            }
            !done
        });
    }
}

/// Plays audio to the default output device
pub struct CpalOutput {
    config: StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    rendered_frames: Arc<AtomicU64>,
    suspended: Arc<AtomicBool>,
    worker: Option<StreamWorker>,
}

impl CpalOutput {
    /// Open the default output device and start its mixing stream
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open(completions: mpsc::UnboundedSender<ChunkId>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Capability("no output device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let preferred = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports_rate(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports_rate(c, 2))
            })
            .map(|c| c.with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE)));

        let supported = match preferred {
            Some(config) => config,
            None => device
                .default_output_config()
                .map_err(|e| Error::Audio(format!("no suitable output config found: {e}")))?,
        };
        let config = supported.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(config.sample_rate.0, completions)));
        let rendered_frames = Arc::new(AtomicU64::new(0));
        let suspended = Arc::new(AtomicBool::new(false));

        let worker = {
            let config = config.clone();
            let mixer = Arc::clone(&mixer);
            let rendered = Arc::clone(&rendered_frames);
            let suspended = Arc::clone(&suspended);
            let channels = usize::from(config.channels.max(1));

            StreamWorker::spawn("colloquy-playback", move || {
                let device = cpal::default_host()
                    .default_output_device()
                    .ok_or_else(|| Error::Capability("no output device".to_string()))?;

                let flag = Arc::clone(&suspended);
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            flag.store(false, Ordering::Relaxed);
                            let first = rendered.load(Ordering::Relaxed);
                            if let Ok(mut mixer) = mixer.lock() {
                                mixer.render(data, channels, first);
                            } else {
                                data.fill(0.0);
                            }
                            rendered.fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
                        },
                        move |err| {
                            tracing::error!(error = %err, "audio playback error");
                            suspended.store(true, Ordering::Relaxed);
                        },
                        None,
                    )
                    .map_err(|e| classify_build_error(&e))
            })?
        };

        Ok(Self {
            config,
            mixer,
            rendered_frames,
            suspended,
            worker: Some(worker),
        })
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    #[allow(clippy::cast_precision_loss)]
    fn current_time(&self) -> f64 {
        self.rendered_frames.load(Ordering::Relaxed) as f64 / f64::from(self.sample_rate())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn schedule(&mut self, id: ChunkId, start_time: f64, buffer: PlayableBuffer) -> Result<()> {
        if buffer.sample_rate != self.sample_rate() {
            return Err(Error::Audio(format!(
                "chunk at {} Hz does not match device rate {}",
                buffer.sample_rate,
                self.sample_rate()
            )));
        }

        let start_frame = (start_time.max(0.0) * f64::from(self.sample_rate())).round() as u64;
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| Error::Audio("playback mixer poisoned".to_string()))?;
        mixer.voices.push(Voice {
            id,
            start_frame,
            samples: buffer.samples,
        });
        Ok(())
    }

    fn stop(&mut self, id: ChunkId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.retain(|voice| voice.id != id);
        }
    }

    fn set_keep_alive(&mut self, enabled: bool) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.keep_alive = enabled;
        }
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    fn resume(&mut self) {
        if let Some(worker) = &self.worker {
            worker.resume();
        }
    }

    fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            tracing::debug!("audio playback stopped");
        }
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.clear();
            mixer.keep_alive = false;
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}
