pub mod codec;
pub mod device;
pub mod mixer;
pub mod recorder;
pub mod scheduler;
pub mod tones;

#[cfg(feature = "devices")]
mod cpal_backend;

#[cfg(feature = "devices")]
pub use cpal_backend::CpalBackend;
pub use device::{ActiveStream, AudioBackend, HeadlessBackend};
pub use mixer::{LoopKind, OutputMixer, SharedMixer};
pub use recorder::{RecordedAudio, SessionRecorder, SharedRecorder};
pub use scheduler::{ChunkId, PlaybackScheduler, ScheduledChunk};
pub use tones::ToneSynth;

/// Microphone capture rate expected by the voice service
pub const INPUT_SAMPLE_RATE: u32 = 16000;
/// Rate of synthesized agent audio and of the output context
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;
/// Samples per outbound microphone block (64ms at 16kHz)
pub const CAPTURE_BLOCK_SIZE: usize = 1024;

/// Mono f32 samples tagged with their sample rate
#[derive(Clone, Debug, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback length in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert to another rate, leaving the buffer untouched when rates match
    pub fn into_rate(self, sample_rate: u32) -> Self {
        if self.sample_rate == sample_rate {
            return self;
        }
        let samples = codec::resample_linear(&self.samples, self.sample_rate, sample_rate);
        Self {
            samples,
            sample_rate,
        }
    }
}

/// Calculate RMS (Root Mean Square) of audio samples
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert RMS to normalized level (0.0 to 1.0) over a -60dB..0dB range
pub fn rms_to_level(rms: f32) -> f32 {
    let db = 20.0 * rms.max(1e-10).log10();
    let normalized = (db + 60.0) / 60.0;
    normalized.clamp(0.0, 1.0)
}
