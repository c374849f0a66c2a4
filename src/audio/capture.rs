//! Audio capture from microphone
//!
//! `CapturePipeline` turns raw device samples into wire frames; `CpalInput`
//! is the microphone that feeds it.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleRate, StreamConfig};

use super::convert::{RateConverter, WIRE_INPUT_RATE, encode_pcm16, mean_abs_amplitude};
use super::device::{
    InputDevice, SampleCallback, StreamWorker, classify_build_error, classify_device_error,
};
use super::meter::VolumeMeter;
use super::{AudioFrame, Direction};
use crate::transport::TransportLink;
use crate::{Error, Result};

/// Preferred capture rate (16kHz for speech)
pub const SAMPLE_RATE: u32 = WIRE_INPUT_RATE;

/// Capture frame length in milliseconds
pub const FRAME_MS: u32 = 128;

/// Number of samples in one frame at `sample_rate`
#[must_use]
pub const fn frame_len(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as usize * frame_ms as usize) / 1000
}

/// Slices microphone samples into fixed frames and forwards them
///
/// Device samples are first brought to the wire rate, then framed. Holds at
/// most one partial frame. Each completed frame updates the input level, is
/// encoded, and handed to the link. Send failures are the link's concern; a
/// frame is never retried.
pub struct CapturePipeline {
    converter: RateConverter,
    frame_len: usize,
    converted: Vec<f32>,
    pending: Vec<f32>,
    meter: Arc<VolumeMeter>,
    link: Arc<dyn TransportLink>,
}

impl CapturePipeline {
    /// Create a pipeline for a device running at `device_rate`
    ///
    /// # Errors
    ///
    /// Returns error if `device_rate` cannot be converted to the wire rate
    pub fn new(
        device_rate: u32,
        frame_ms: u32,
        meter: Arc<VolumeMeter>,
        link: Arc<dyn TransportLink>,
    ) -> Result<Self> {
        let converter = RateConverter::new(device_rate, WIRE_INPUT_RATE)?;
        let frame_len = frame_len(converter.wire_rate(), frame_ms).max(1);
        Ok(Self {
            converter,
            frame_len,
            converted: Vec::new(),
            pending: Vec::with_capacity(frame_len),
            meter,
            link,
        })
    }

    /// Samples per frame at the wire rate
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Accept samples from the audio callback
    pub fn push_samples(&mut self, samples: &[f32]) {
        let mut converted = std::mem::take(&mut self.converted);
        converted.clear();

        if let Err(e) = self.converter.process(samples, &mut converted) {
            tracing::warn!(error = %e, "dropping capture block");
            self.converted = converted;
            return;
        }

        let mut rest = converted.as_slice();
        while !rest.is_empty() {
            let take = (self.frame_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_len {
                self.process_frame(&self.pending);
                self.pending.clear();
            }
        }

        self.converted = converted;
    }

    /// Handle one complete frame of wire-rate samples
    pub fn process_frame(&self, frame: &[f32]) {
        self.meter.set_input(mean_abs_amplitude(frame));

        self.link.send(AudioFrame {
            direction: Direction::Outbound,
            sample_rate: self.converter.wire_rate(),
            pcm: encode_pcm16(frame),
        });
    }

    /// Wrap the pipeline as a device callback
    #[must_use]
    pub fn into_callback(mut self) -> SampleCallback {
        Box::new(move |samples| self.push_samples(samples))
    }
}

/// Where the running stream delivers samples once capture has started
type CallbackSlot = Arc<Mutex<Option<SampleCallback>>>;

/// Hand `samples` to the installed callback, if any
///
/// Never blocks the audio thread: a block arriving while the slot is being
/// swapped is dropped.
fn forward(slot: &CallbackSlot, samples: &[f32]) {
    let Ok(mut guard) = slot.try_lock() else {
        return;
    };
    if let Some(on_samples) = guard.as_mut() {
        on_samples(samples);
    }
}

/// Captures audio from the default input device
///
/// The stream is built and playing as soon as the device is opened, so a
/// refused microphone surfaces from [`CpalInput::open`]. Samples are
/// discarded until [`InputDevice::start`] installs a callback.
pub struct CpalInput {
    sample_rate: u32,
    worker: Option<StreamWorker>,
    slot: CallbackSlot,
    suspended: Arc<AtomicBool>,
}

impl CpalInput {
    /// Open the default input device and start its stream
    ///
    /// Prefers a mono configuration at `preferred_rate` and falls back to the
    /// device default; the pipeline converts other rates.
    ///
    /// # Errors
    ///
    /// Returns `Error::Capability` if no input device or configuration is
    /// available and `Error::Permission` if the platform refuses access
    pub fn open(preferred_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Capability("no input device available".to_string()))?;

        let preferred = device
            .supported_input_configs()
            .map_err(|e| classify_device_error(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(preferred_rate)
                    && c.max_sample_rate() >= SampleRate(preferred_rate)
            })
            .map(|c| c.with_sample_rate(SampleRate(preferred_rate)));

        let supported = match preferred {
            Some(config) => config,
            None => device
                .default_input_config()
                .map_err(|e| Error::Audio(format!("no suitable audio config found: {e}")))?,
        };

        let config = supported.config();
        let sample_rate = config.sample_rate.0;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        let slot: CallbackSlot = Arc::new(Mutex::new(None));
        let suspended = Arc::new(AtomicBool::new(false));
        let worker = Self::spawn_stream(config, Arc::clone(&slot), Arc::clone(&suspended))?;

        Ok(Self {
            sample_rate,
            worker: Some(worker),
            slot,
            suspended,
        })
    }

    fn spawn_stream(
        config: StreamConfig,
        slot: CallbackSlot,
        suspended: Arc<AtomicBool>,
    ) -> Result<StreamWorker> {
        let channels = usize::from(config.channels.max(1));

        StreamWorker::spawn("colloquy-capture", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| Error::Capability("no input device".to_string()))?;

            let mut mono = Vec::new();
            let flag = Arc::clone(&suspended);
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        flag.store(false, Ordering::Relaxed);
                        if channels == 1 {
                            forward(&slot, data);
                        } else {
                            downmix(data, channels, &mut mono);
                            forward(&slot, &mono);
                        }
                    },
                    move |err| {
                        tracing::error!(error = %err, "audio capture error");
                        suspended.store(true, Ordering::Relaxed);
                    },
                    None,
                )
                .map_err(|e| classify_build_error(&e))
        })
    }
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, on_samples: SampleCallback) -> Result<()> {
        if self.worker.is_none() {
            return Err(Error::Audio("input device is closed".to_string()));
        }

        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Audio("capture callback lock poisoned".to_string()))?;
        if slot.is_none() {
            *slot = Some(on_samples);
            tracing::debug!("audio capture started");
        }
        Ok(())
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
            tracing::debug!("audio capture stopped");
        }
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Average interleaved frames into `out`
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        data.chunks(channels)
            .map(|f| f.iter().sum::<f32>() / f.len() as f32),
    );
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
