//! Conversion between device samples and the wire format
//!
//! The wire carries signed 16-bit little-endian mono PCM: 16 kHz outbound,
//! 24 kHz inbound. Devices work in `f32` at whatever rate they support.

use std::borrow::Cow;

use crate::{Error, Result};

/// Outbound (microphone) wire rate
pub const WIRE_INPUT_RATE: u32 = 16_000;

/// Inbound (synthesized speech) wire rate
pub const WIRE_OUTPUT_RATE: u32 = 24_000;

/// Stride used when sampling the volume envelope
pub const VOLUME_STRIDE: usize = 4;

/// Bytes per wire sample
const BYTES_PER_SAMPLE: usize = 2;

/// Resampler input block size
const RESAMPLE_CHUNK: usize = 1024;

/// Decoded audio ready for an output device
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    /// Sample rate of `samples`
    pub sample_rate: u32,
}

impl PlayableBuffer {
    /// Playback length in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Whether there is nothing to play
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Encode float samples as 16-bit little-endian PCM
///
/// Values outside `[-1.0, 1.0]` are clamped.
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode 16-bit PCM into a buffer at `target_rate`
///
/// Interleaved multi-channel input is averaged down to mono. The buffer is
/// resampled when `source_rate` differs from `target_rate`.
///
/// # Errors
///
/// Returns error if the payload is not whole frames or resampling fails
pub fn decode_pcm16(
    bytes: &[u8],
    source_rate: u32,
    channels: u16,
    target_rate: u32,
) -> Result<PlayableBuffer> {
    if channels == 0 || source_rate == 0 || target_rate == 0 {
        return Err(Error::Protocol(format!(
            "invalid pcm layout: {channels} channels at {source_rate} Hz"
        )));
    }

    let frame_bytes = BYTES_PER_SAMPLE * usize::from(channels);
    if bytes.len() % frame_bytes != 0 {
        return Err(Error::Protocol(format!(
            "pcm payload of {} bytes is not a multiple of {frame_bytes}",
            bytes.len()
        )));
    }

    let scale = f32::from(channels);
    let mono: Vec<f32> = bytes
        .chunks_exact(frame_bytes)
        .map(|frame| {
            frame
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|s| f32::from(i16::from_le_bytes([s[0], s[1]])) / 32768.0)
                .sum::<f32>()
                / scale
        })
        .collect();

    let samples = if source_rate == target_rate {
        mono
    } else {
        resample(&mono, source_rate, target_rate)?
    };

    Ok(PlayableBuffer {
        samples,
        sample_rate: target_rate,
    })
}

/// Drop samples to bring `device_rate` down to `wire_rate`
///
/// Nearest-integer decimation without an anti-aliasing filter: keeps every
/// `floor(device_rate / wire_rate)`-th sample. Borrows the input untouched
/// when no decimation applies.
#[must_use]
pub fn decimate(samples: &[f32], device_rate: u32, wire_rate: u32) -> Cow<'_, [f32]> {
    if wire_rate == 0 || device_rate <= wire_rate {
        return Cow::Borrowed(samples);
    }

    let ratio = (device_rate / wire_rate) as usize;
    if ratio <= 1 {
        return Cow::Borrowed(samples);
    }

    let len = samples.len() / ratio;
    Cow::Owned((0..len).map(|i| samples[i * ratio]).collect())
}

/// Brings a stream of device samples to a wire rate
///
/// Exact multiples of the wire rate are decimated. Any other device rate is
/// resampled with rubato, so the output always runs at the wire rate. Input
/// may arrive in blocks of any length; leftovers carry into the next call.
pub struct RateConverter {
    device_rate: u32,
    wire_rate: u32,
    mode: ConvertMode,
}

enum ConvertMode {
    Passthrough,
    Decimate {
        carry: Vec<f32>,
    },
    Resample {
        resampler: rubato::FftFixedIn<f32>,
        pending: Vec<f32>,
    },
}

impl RateConverter {
    /// Converter from `device_rate` to `wire_rate`
    ///
    /// # Errors
    ///
    /// Returns error if a rate is zero or the resampler cannot be built
    pub fn new(device_rate: u32, wire_rate: u32) -> Result<Self> {
        if device_rate == 0 || wire_rate == 0 {
            return Err(Error::Audio(format!(
                "invalid conversion from {device_rate} Hz to {wire_rate} Hz"
            )));
        }

        let mode = if device_rate == wire_rate {
            ConvertMode::Passthrough
        } else if device_rate > wire_rate && device_rate % wire_rate == 0 {
            ConvertMode::Decimate { carry: Vec::new() }
        } else {
            let resampler = rubato::FftFixedIn::<f32>::new(
                device_rate as usize,
                wire_rate as usize,
                RESAMPLE_CHUNK,
                2,
                1,
            )
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
            tracing::debug!(device_rate, wire_rate, "capture resampling enabled");
            ConvertMode::Resample {
                resampler,
                pending: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            }
        };

        Ok(Self {
            device_rate,
            wire_rate,
            mode,
        })
    }

    /// Rate of the converted samples
    #[must_use]
    pub const fn wire_rate(&self) -> u32 {
        self.wire_rate
    }

    /// Convert `samples`, appending the result to `out`
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn process(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<()> {
        use rubato::Resampler;

        let (device_rate, wire_rate) = (self.device_rate, self.wire_rate);
        match &mut self.mode {
            ConvertMode::Passthrough => out.extend_from_slice(samples),
            ConvertMode::Decimate { carry } => {
                let ratio = (device_rate / wire_rate) as usize;
                carry.extend_from_slice(samples);
                let whole = carry.len() - carry.len() % ratio;
                out.extend_from_slice(&decimate(&carry[..whole], device_rate, wire_rate));
                carry.drain(..whole);
            }
            ConvertMode::Resample { resampler, pending } => {
                pending.extend_from_slice(samples);
                loop {
                    let needed = resampler.input_frames_next();
                    if pending.len() < needed {
                        break;
                    }
                    let converted = resampler
                        .process(&[&pending[..needed]], None)
                        .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
                    out.extend_from_slice(&converted[0]);
                    pending.drain(..needed);
                }
            }
        }
        Ok(())
    }
}

/// Coarse loudness of a frame in `[0.0, 1.0]`
///
/// Averages the absolute amplitude of every `VOLUME_STRIDE`-th sample.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_abs_amplitude(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let (sum, count) = samples
        .iter()
        .step_by(VOLUME_STRIDE)
        .fold((0.0f32, 0usize), |(sum, n), s| (sum + s.abs(), n + 1));

    (sum / count as f32).clamp(0.0, 1.0)
}

/// Resample mono audio using rubato
///
/// The final partial block is zero-padded and the output trimmed to the
/// expected length.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let expected =
        (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);
    let mut block = vec![0.0f32; RESAMPLE_CHUNK];

    // Feed trailing silence so the filter delay is flushed as well
    let padded_len = samples.len() + delay * from_rate as usize / to_rate as usize + 1;
    let mut offset = 0;
    while offset < padded_len || output.len() < expected + delay {
        block.fill(0.0);
        if offset < samples.len() {
            let end = (offset + RESAMPLE_CHUNK).min(samples.len());
            block[..end - offset].copy_from_slice(&samples[offset..end]);
        }
        let result = resampler
            .process(&[block.as_slice()], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
        offset += RESAMPLE_CHUNK;
    }

    Ok(output.into_iter().skip(delay).take(expected).collect())
}
