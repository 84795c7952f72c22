use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::menu::{Language, Prompt};
use crate::audio::{PcmBuffer, SharedMixer, ToneSynth};
use crate::error::{CallError, Result};

/// Extra time a host synthesizer gets beyond the estimated speaking time
pub const SPEECH_GRACE: Duration = Duration::from_secs(2);

/// Speaks an IVR announcement into the output mix
#[async_trait]
pub trait PromptPlayer: Send + Sync {
    /// Resolves once the announcement has finished playing
    async fn play(&self, prompt: &Prompt, output: &SharedMixer);
}

/// Queue the prompt chime on the output and return its length
fn play_chime(output: &SharedMixer, volume: f32) -> Duration {
    let mut mixer = output.lock();
    let rate = mixer.sample_rate().max(1);
    let chime = ToneSynth::new(rate).prompt_chime();
    let length = Duration::from_millis(chime.len() as u64 * 1000 / rate as u64);
    mixer.play_once(chime, volume);
    length
}

/// Plays a chime and then holds for the time the announcement would take to
/// speak. Used when neither recorded clips nor a host synthesizer exist.
pub struct ChimePromptPlayer {
    words_per_minute: u32,
    volume: f32,
}

impl ChimePromptPlayer {
    pub fn new(words_per_minute: u32, volume: f32) -> Self {
        Self {
            words_per_minute: words_per_minute.max(1),
            volume,
        }
    }
}

impl Default for ChimePromptPlayer {
    fn default() -> Self {
        Self::new(160, 0.4)
    }
}

#[async_trait]
impl PromptPlayer for ChimePromptPlayer {
    async fn play(&self, prompt: &Prompt, output: &SharedMixer) {
        let chime = play_chime(output, self.volume);
        tracing::debug!("Prompt: {}", prompt.text());
        let speaking = Duration::from_millis(prompt.estimated_duration_ms(self.words_per_minute));
        tokio::time::sleep(chime + speaking).await;
    }
}

/// Pre-recorded announcements, one WAV file per prompt named after
/// [`Prompt::clip_name`]. Prompts without a clip fall back to the chime.
pub struct ClipPromptPlayer {
    dir: PathBuf,
    volume: f32,
    fallback: ChimePromptPlayer,
    clips: Mutex<HashMap<String, Option<Arc<PcmBuffer>>>>,
}

impl ClipPromptPlayer {
    pub fn new(dir: impl Into<PathBuf>, volume: f32) -> Self {
        Self {
            dir: dir.into(),
            volume,
            fallback: ChimePromptPlayer::new(160, volume),
            clips: Mutex::new(HashMap::new()),
        }
    }

    async fn clip(&self, prompt: &Prompt) -> Option<Arc<PcmBuffer>> {
        let name = prompt.clip_name();
        if let Some(cached) = self.clips.lock().get(&name) {
            return cached.clone();
        }

        let path = self.dir.join(format!("{}.wav", name));
        let loaded = if !path.exists() {
            tracing::debug!("No recorded clip for prompt {}", name);
            None
        } else {
            match tokio::task::spawn_blocking(move || read_clip(&path)).await {
                Ok(Ok(clip)) => Some(Arc::new(clip)),
                Ok(Err(e)) => {
                    tracing::warn!("{}", e);
                    None
                }
                Err(e) => {
                    tracing::warn!("Prompt clip loader failed: {}", e);
                    None
                }
            }
        };
        self.clips.lock().insert(name, loaded.clone());
        loaded
    }
}

#[async_trait]
impl PromptPlayer for ClipPromptPlayer {
    async fn play(&self, prompt: &Prompt, output: &SharedMixer) {
        let Some(clip) = self.clip(prompt).await else {
            return self.fallback.play(prompt, output).await;
        };
        let length = {
            let mut mixer = output.lock();
            let clip = PcmBuffer::clone(&clip).into_rate(mixer.sample_rate());
            let length = clip.duration_secs();
            mixer.play_once(clip.samples, self.volume);
            length
        };
        tracing::debug!("Prompt clip: {}", prompt.clip_name());
        tokio::time::sleep(Duration::from_secs_f64(length)).await;
    }
}

/// Decode a WAV clip to mono f32
fn read_clip(path: &Path) -> Result<PcmBuffer> {
    let fail = |e: hound::Error| {
        CallError::Codec(format!("Failed to read prompt clip {}: {}", path.display(), e))
    };
    let mut reader = hound::WavReader::open(path).map_err(fail)?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(fail)?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(fail)?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok(PcmBuffer::new(samples, spec.sample_rate))
}

/// Announcement handed to a host speech synthesizer
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechRequest {
    pub id: u64,
    pub text: String,
    pub locale: &'static str,
}

/// Host side text-to-speech, e.g. the webview's speech synthesis
pub trait SpeechSink: Send + Sync {
    /// Start speaking. Completion is reported through
    /// [`HostSpeechPlayer::finished`].
    fn speak(&self, request: SpeechRequest) -> std::result::Result<(), String>;
}

/// Chime on the output, then the host speaks the text and reports back
pub struct HostSpeechPlayer {
    sink: Arc<dyn SpeechSink>,
    words_per_minute: u32,
    volume: f32,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl HostSpeechPlayer {
    pub fn new(sink: Arc<dyn SpeechSink>, words_per_minute: u32, volume: f32) -> Self {
        Self {
            sink,
            words_per_minute: words_per_minute.max(1),
            volume,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The host finished speaking `id`. False for unknown or expired ids.
    pub fn finished(&self, id: u64) -> bool {
        match self.pending.lock().remove(&id) {
            Some(done) => done.send(()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl PromptPlayer for HostSpeechPlayer {
    async fn play(&self, prompt: &Prompt, output: &SharedMixer) {
        let chime = play_chime(output, self.volume);
        tokio::time::sleep(chime).await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done, finished) = oneshot::channel();
        self.pending.lock().insert(id, done);
        let request = SpeechRequest {
            id,
            text: prompt.text(),
            locale: prompt.language().unwrap_or(Language::English).locale(),
        };
        let expected = Duration::from_millis(prompt.estimated_duration_ms(self.words_per_minute));

        if let Err(e) = self.sink.speak(request) {
            tracing::warn!("Speech unavailable, holding for the prompt length: {}", e);
            self.pending.lock().remove(&id);
            tokio::time::sleep(expected).await;
            return;
        }
        if tokio::time::timeout(expected + SPEECH_GRACE, finished)
            .await
            .is_err()
        {
            tracing::warn!("Prompt {} was not reported as spoken, moving on", id);
            self.pending.lock().remove(&id);
        }
    }
}
