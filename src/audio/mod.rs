//! Audio devices, conversion, capture and playback

pub mod capture;
pub mod convert;
pub mod device;
pub mod meter;
pub mod playback;

pub use capture::{CapturePipeline, CpalInput, samples_to_wav};
pub use convert::{PlayableBuffer, WIRE_INPUT_RATE, WIRE_OUTPUT_RATE, decode_pcm16, encode_pcm16};
pub use device::{AudioBackend, ChunkId, CpalBackend, InputDevice, OutputDevice, SampleCallback};
pub use meter::{VolumeEnvelope, VolumeMeter};
pub use playback::{CpalOutput, PlaybackScheduler, ScheduledChunk};

/// Which way an audio frame travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Synthesized speech from the service
    Inbound,
    /// Microphone audio to the service
    Outbound,
}

/// A block of 16-bit little-endian mono PCM on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Travel direction
    pub direction: Direction,
    /// Sample rate of `pcm`
    pub sample_rate: u32,
    /// Raw sample bytes
    pub pcm: Vec<u8>,
}
