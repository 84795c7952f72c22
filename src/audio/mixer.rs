use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use super::recorder::SharedRecorder;
use super::scheduler::ChunkId;

/// Samples kept for the spectrum visualizer
pub const ANALYSIS_WINDOW: usize = 4096;

/// Looping beds that can run under the call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Ringback,
    HoldMusic,
    Ambience,
}

/// Agent audio pinned to an absolute position on the output clock
struct VoiceBuffer {
    start_sample: u64,
    samples: Vec<f32>,
}

impl VoiceBuffer {
    fn end_sample(&self) -> u64 {
        self.start_sample + self.samples.len() as u64
    }
}

struct LoopSource {
    samples: Vec<f32>,
    position: usize,
    volume: f32,
}

struct OneShot {
    samples: Vec<f32>,
    position: usize,
    volume: f32,
}

/// Output context: mixes agent speech, tones and loops into one mono stream.
///
/// The number of rendered samples is the output clock; whoever drives
/// [`OutputMixer::render`] (a sound card callback or the headless ticker)
/// advances time.
pub struct OutputMixer {
    sample_rate: u32,
    rendered: u64,
    voice: BTreeMap<ChunkId, VoiceBuffer>,
    loops: HashMap<LoopKind, LoopSource>,
    one_shots: Vec<OneShot>,
    /// Master volume (0.0 - 1.0)
    master_volume: f32,
    analysis: VecDeque<f32>,
    recorder: Option<SharedRecorder>,
}

pub type SharedMixer = Arc<Mutex<OutputMixer>>;

impl OutputMixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            rendered: 0,
            voice: BTreeMap::new(),
            loops: HashMap::new(),
            one_shots: Vec::new(),
            master_volume: 1.0,
            analysis: VecDeque::with_capacity(ANALYSIS_WINDOW),
            recorder: None,
        }
    }

    pub fn shared(sample_rate: u32) -> SharedMixer {
        Arc::new(Mutex::new(Self::new(sample_rate)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current output time in seconds
    pub fn clock_secs(&self) -> f64 {
        self.rendered as f64 / self.sample_rate as f64
    }

    /// Queue agent audio to start at `start_secs` on the output clock
    pub fn schedule_voice(&mut self, id: ChunkId, start_secs: f64, samples: Vec<f32>) {
        let start_sample = (start_secs * self.sample_rate as f64).round().max(0.0) as u64;
        if start_sample < self.rendered {
            tracing::trace!(
                "Voice chunk {} starts {} samples in the past",
                id,
                self.rendered - start_sample
            );
        }
        self.voice.insert(
            id,
            VoiceBuffer {
                start_sample,
                samples,
            },
        );
    }

    /// Stop specific agent chunks immediately
    pub fn cancel_voice(&mut self, ids: &[ChunkId]) {
        for id in ids {
            self.voice.remove(id);
        }
    }

    pub fn pending_voice(&self) -> usize {
        self.voice.len()
    }

    pub fn start_loop(&mut self, kind: LoopKind, samples: Vec<f32>, volume: f32) {
        if samples.is_empty() {
            return;
        }
        self.loops.insert(
            kind,
            LoopSource {
                samples,
                position: 0,
                volume: volume.clamp(0.0, 1.0),
            },
        );
    }

    pub fn stop_loop(&mut self, kind: LoopKind) {
        self.loops.remove(&kind);
    }

    pub fn is_looping(&self, kind: LoopKind) -> bool {
        self.loops.contains_key(&kind)
    }

    /// Play a sound once on top of everything else
    pub fn play_once(&mut self, samples: Vec<f32>, volume: f32) {
        if samples.is_empty() {
            return;
        }
        self.one_shots.push(OneShot {
            samples,
            position: 0,
            volume: volume.clamp(0.0, 1.0),
        });
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = volume.clamp(0.0, 1.0);
    }

    /// Route every rendered frame into a recorder as well
    pub fn set_recorder(&mut self, recorder: Option<SharedRecorder>) {
        self.recorder = recorder;
    }

    /// Drop all sources; the clock keeps running
    pub fn clear(&mut self) {
        self.voice.clear();
        self.loops.clear();
        self.one_shots.clear();
        self.analysis.clear();
        self.recorder = None;
    }

    /// Most recent output, oldest first, zero-padded to `len`
    pub fn analysis_window(&self, len: usize) -> Vec<f32> {
        let available = self.analysis.len().min(len);
        let mut window = vec![0.0; len - available];
        window.extend(self.analysis.iter().skip(self.analysis.len() - available));
        window
    }

    /// Mix the next `output.len()` samples and advance the clock
    pub fn render(&mut self, output: &mut [f32]) {
        output.fill(0.0);
        let frame_start = self.rendered;
        let frame_end = frame_start + output.len() as u64;

        for buffer in self.voice.values() {
            let from = buffer.start_sample.max(frame_start);
            let to = buffer.end_sample().min(frame_end);
            for pos in from..to {
                output[(pos - frame_start) as usize] +=
                    buffer.samples[(pos - buffer.start_sample) as usize];
            }
        }
        self.voice.retain(|_, b| b.end_sample() > frame_end);

        for source in self.loops.values_mut() {
            for sample in output.iter_mut() {
                *sample += source.samples[source.position] * source.volume;
                source.position = (source.position + 1) % source.samples.len();
            }
        }

        for shot in self.one_shots.iter_mut() {
            let remaining = &shot.samples[shot.position..];
            let n = remaining.len().min(output.len());
            for (out, s) in output.iter_mut().zip(&remaining[..n]) {
                *out += s * shot.volume;
            }
            shot.position += n;
        }
        self.one_shots.retain(|s| s.position < s.samples.len());

        // Apply master volume and clamp
        for sample in output.iter_mut() {
            *sample = (*sample * self.master_volume).clamp(-1.0, 1.0);
        }

        self.rendered = frame_end;

        self.analysis.extend(output.iter().copied());
        while self.analysis.len() > ANALYSIS_WINDOW {
            self.analysis.pop_front();
        }

        if let Some(recorder) = &self.recorder {
            if let Some(rec) = recorder.lock().as_mut() {
                rec.push_mix(output);
            }
        }
    }
}
