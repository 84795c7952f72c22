//! Local recording of a call: caller microphone and everything played out,
//! mixed into one track while the call runs and encoded as WAV at the end

use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;

use super::codec::{f32_to_pcm16, resample_linear};
use crate::error::{CallError, Result};

pub const RECORDING_MIME_TYPE: &str = "audio/wav";

/// Finished recording ready for upload
#[derive(Clone, Debug)]
pub struct RecordedAudio {
    pub data: Bytes,
    pub mime_type: &'static str,
    pub sample_rate: u32,
    pub duration_ms: u64,
}

/// Default cap on the length of one recording
pub const DEFAULT_MAX_RECORDING_SECS: u32 = 1800;

/// Mixes both sides of the call into one 16-bit track as audio arrives.
/// Audio past the length limit is dropped.
pub struct SessionRecorder {
    caller_rate: u32,
    mix_rate: u32,
    max_samples: usize,
    samples: Vec<i16>,
    caller_pos: usize,
    mix_pos: usize,
    truncated: bool,
}

/// `None` once the recording has been taken for finalisation, so a second
/// stop is a no-op.
pub type SharedRecorder = Arc<Mutex<Option<SessionRecorder>>>;

impl SessionRecorder {
    pub fn new(caller_rate: u32, mix_rate: u32) -> Self {
        Self {
            caller_rate,
            mix_rate,
            max_samples: DEFAULT_MAX_RECORDING_SECS as usize * mix_rate as usize,
            samples: Vec::new(),
            caller_pos: 0,
            mix_pos: 0,
            truncated: false,
        }
    }

    /// Keep at most `max_secs` of audio
    pub fn limited(mut self, max_secs: u32) -> Self {
        self.max_samples = max_secs as usize * self.mix_rate as usize;
        self
    }

    pub fn into_shared(self) -> SharedRecorder {
        Arc::new(Mutex::new(Some(self)))
    }

    pub fn shared(caller_rate: u32, mix_rate: u32) -> SharedRecorder {
        Self::new(caller_rate, mix_rate).into_shared()
    }

    /// Microphone samples at the capture rate
    pub fn push_caller(&mut self, samples: &[f32]) {
        let samples = resample_linear(samples, self.caller_rate, self.mix_rate);
        self.caller_pos = self.add_at(self.caller_pos, &samples);
    }

    /// Rendered output samples at the playback rate
    pub fn push_mix(&mut self, samples: &[f32]) {
        self.mix_pos = self.add_at(self.mix_pos, samples);
    }

    /// Sum `samples` into the track from `pos`, returning the new position
    fn add_at(&mut self, pos: usize, samples: &[f32]) -> usize {
        let next = pos + samples.len();
        let start = pos.min(self.max_samples);
        let end = next.min(self.max_samples);
        if end < next && !self.truncated {
            self.truncated = true;
            tracing::warn!(
                "Recording reached {}s, later audio is not kept",
                self.max_samples / self.mix_rate.max(1) as usize
            );
        }
        if self.samples.len() < end {
            self.samples.resize(end, 0);
        }
        let pcm = f32_to_pcm16(&samples[..end - start]);
        for (slot, sample) in self.samples[start..end].iter_mut().zip(pcm) {
            *slot = slot.saturating_add(sample);
        }
        next
    }

    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / self.mix_rate.max(1) as u64
    }

    /// Whether audio was dropped at the length limit
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Encode the mixed track as 16-bit WAV
    pub fn finish(self) -> Result<RecordedAudio> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.mix_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let len = self.samples.len();
        let mut cursor = Cursor::new(Vec::with_capacity(44 + len * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| CallError::Recording(e.to_string()))?;
            for sample in &self.samples {
                writer
                    .write_sample(*sample)
                    .map_err(|e| CallError::Recording(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| CallError::Recording(e.to_string()))?;
        }

        Ok(RecordedAudio {
            data: Bytes::from(cursor.into_inner()),
            mime_type: RECORDING_MIME_TYPE,
            sample_rate: self.mix_rate,
            duration_ms: len as u64 * 1000 / self.mix_rate.max(1) as u64,
        })
    }
}

/// Stop the recording exactly once. Later calls return `None`.
pub fn stop_recording(recorder: &SharedRecorder) -> Option<Result<RecordedAudio>> {
    let taken = recorder.lock().take();
    taken.map(SessionRecorder::finish)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_mixes_both_tracks() {
        let mut recorder = SessionRecorder::new(8000, 16000);
        recorder.push_caller(&[0.25; 800]);
        recorder.push_mix(&[0.25; 1000]);
        assert_eq!(recorder.duration_ms(), 100);

        let audio = recorder.finish().unwrap();
        assert_eq!(audio.mime_type, "audio/wav");
        assert_eq!(audio.duration_ms, 100);

        let mut reader = hound::WavReader::new(Cursor::new(audio.data.to_vec())).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 1600);
        // both tracks overlap at the start
        assert!((samples[10] as f32 / 32767.0 - 0.5).abs() < 0.01);
        // only the caller track remains at the end
        assert!((samples[1500] as f32 / 32767.0 - 0.25).abs() < 0.01);
    }

    #[test]
    fn test_recording_stops_growing_at_limit() {
        let mut recorder = SessionRecorder::new(8000, 8000).limited(1);
        recorder.push_mix(&[0.1; 6000]);
        assert!(!recorder.is_truncated());
        recorder.push_mix(&[0.1; 6000]);
        recorder.push_caller(&[0.1; 16000]);
        recorder.push_mix(&[0.1; 4000]);

        assert!(recorder.is_truncated());
        assert_eq!(recorder.duration_ms(), 1000);
        let audio = recorder.finish().unwrap();
        assert_eq!(audio.duration_ms, 1000);
        assert_eq!(audio.data.len(), 44 + 8000 * 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let recorder = SessionRecorder::shared(16000, 24000);
        recorder.lock().as_mut().unwrap().push_mix(&[0.1; 240]);

        let first = stop_recording(&recorder);
        assert!(matches!(first, Some(Ok(_))));
        assert!(stop_recording(&recorder).is_none());
    }

    #[test]
    fn test_empty_recording_is_valid_wav() {
        let audio = SessionRecorder::new(16000, 24000).finish().unwrap();
        assert_eq!(audio.duration_ms, 0);
        assert_eq!(audio.data.len(), 44);
    }
}
