//! Shared volume envelope
//!
//! Audio callbacks write levels at block rate; the display loop reads them
//! at its own cadence. Each level is an independent atomic so a reader never
//! observes a torn value, but input and output are not updated together.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// Level published for output while any chunk is scheduled
pub const OUTPUT_ACTIVE_LEVEL: f32 = 0.5;

/// Level above which a side is considered to be speaking
pub const SPEAKING_THRESHOLD: f32 = 0.01;

/// Input and output levels in `[0.0, 1.0]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VolumeEnvelope {
    /// Microphone level
    pub input: f32,
    /// Playback level
    pub output: f32,
}

/// Lock-free cell holding the current volume envelope
#[derive(Debug, Default)]
pub struct VolumeMeter {
    input: AtomicU32,
    output: AtomicU32,
}

impl VolumeMeter {
    /// Create a meter with both levels at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest microphone level
    pub fn set_input(&self, level: f32) {
        self.input.store(sanitize(level).to_bits(), Ordering::Relaxed);
    }

    /// Record the latest playback level
    pub fn set_output(&self, level: f32) {
        self.output.store(sanitize(level).to_bits(), Ordering::Relaxed);
    }

    /// Read both levels
    #[must_use]
    pub fn snapshot(&self) -> VolumeEnvelope {
        VolumeEnvelope {
            input: f32::from_bits(self.input.load(Ordering::Relaxed)),
            output: f32::from_bits(self.output.load(Ordering::Relaxed)),
        }
    }

    /// Zero both levels
    pub fn reset(&self) {
        self.set_input(0.0);
        self.set_output(0.0);
    }
}

fn sanitize(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}
