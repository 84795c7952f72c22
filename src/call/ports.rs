//! Collaborators the call engine talks to, and default implementations

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::record::CallRecord;
use super::session::{CallStatus, TranscriptLine};
use crate::audio::{RecordedAudio, ScheduledChunk};
use crate::ivr::{Department, IvrState, Language};
use crate::visualizer::SpectrumFrame;

/// Agent persona supplied by the agent builder
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    /// Display or provider voice name
    pub voice_profile: String,
    pub voice_style_description: String,
    pub system_prompt_text: String,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Instruction sent to the voice service once the caller is routed
    pub fn system_prompt(&self, department: Department, language: Language) -> String {
        let mut prompt = if self.system_prompt_text.trim().is_empty() {
            format!("You are {}, a helpful customer service agent.", self.name)
        } else {
            self.system_prompt_text.trim().to_string()
        };
        if !self.voice_style_description.trim().is_empty() {
            prompt.push_str("\n\nSpeaking style: ");
            prompt.push_str(self.voice_style_description.trim());
        }
        prompt.push_str(&format!(
            "\n\nThe caller chose the {} department from the phone menu.",
            department.display_name(Language::English)
        ));
        prompt.push_str(match language {
            Language::English => " Reply in English.",
            Language::Spanish => " The caller selected Spanish, so reply only in Spanish.",
        });
        prompt
    }
}

/// Call history storage
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn append_call_record(&self, record: &CallRecord) -> Result<(), String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Transient user notifications (toasts)
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Remote object storage for recordings
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Returns the public URL of the uploaded recording
    async fn upload(&self, recording: &RecordedAudio) -> Result<String, String>;
}

/// Everything the UI needs to redraw
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CallUpdate {
    Status(CallStatus),
    Ivr(IvrState),
    Transcript(TranscriptLine),
    Flags {
        muted: bool,
        on_hold: bool,
        ambience: bool,
    },
    Digits(String),
    /// Agent audio placed on the output timeline
    AgentSpeech(ScheduledChunk),
    /// Barge-in at `at` seconds of output clock
    Interrupted { at: f64, cancelled: usize },
    Spectrum(SpectrumFrame),
    Notification { message: String, severity: Severity },
    /// `None` when the call never reached an agent
    Finalized { record: Option<CallRecord> },
}

pub trait CallObserver: Send + Sync {
    fn on_update(&self, update: CallUpdate);
}

pub struct NullObserver;

impl CallObserver for NullObserver {
    fn on_update(&self, _update: CallUpdate) {}
}

/// Call history kept in memory
#[derive(Default)]
pub struct MemoryCallHistory {
    records: RwLock<Vec<CallRecord>>,
}

impl MemoryCallHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl PersistenceSink for MemoryCallHistory {
    async fn append_call_record(&self, record: &CallRecord) -> Result<(), String> {
        self.records.write().push(record.clone());
        Ok(())
    }
}

/// Call history stored as a JSON array on disk
pub struct JsonFileHistory {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// `<data_dir>/voicedesk/call_history.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voicedesk")
            .join("call_history.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Vec<CallRecord>, String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| e.to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl PersistenceSink for JsonFileHistory {
    async fn append_call_record(&self, record: &CallRecord) -> Result<(), String> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        records.push(record.clone());

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| e.to_string())?;
        }
        let content = serde_json::to_string_pretty(&records).map_err(|e| e.to_string())?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!("Call record {} saved to {}", record.id, self.path.display());
        Ok(())
    }
}

pub const LOCAL_RECORDING_PREFIX: &str = "blob:voicedesk/";

/// Recordings kept locally before the oldest is dropped
pub const MAX_LOCAL_RECORDINGS: usize = 20;

/// Session-scoped store used when a recording cannot be uploaded. Holds at
/// most `capacity` recordings, evicting the oldest.
pub struct LocalRecordingStore {
    capacity: usize,
    recordings: RwLock<(HashMap<String, RecordedAudio>, VecDeque<String>)>,
}

impl Default for LocalRecordingStore {
    fn default() -> Self {
        Self::with_capacity(MAX_LOCAL_RECORDINGS)
    }
}

impl LocalRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recordings: RwLock::new((HashMap::new(), VecDeque::new())),
        }
    }

    /// Keep the recording and return a session-scoped reference to it
    pub fn store(&self, recording: RecordedAudio) -> String {
        let url = format!("{}{}", LOCAL_RECORDING_PREFIX, Uuid::new_v4());
        let mut guard = self.recordings.write();
        let (recordings, order) = &mut *guard;
        while order.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                recordings.remove(&oldest);
                tracing::debug!("Dropped local recording {}", oldest);
            }
        }
        recordings.insert(url.clone(), recording);
        order.push_back(url.clone());
        url
    }

    pub fn get(&self, url: &str) -> Option<RecordedAudio> {
        self.recordings.read().0.get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.recordings.read().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.read().0.is_empty()
    }
}

/// Notifications written to the log
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!("{}", message),
            Severity::Warning => tracing::warn!("{}", message),
            Severity::Error => tracing::error!("{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::CallSession;
    use bytes::Bytes;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("voicedesk-test-{}", Uuid::new_v4()))
            .join("call_history.json")
    }

    #[test]
    fn test_system_prompt_composition() {
        let agent = AgentDescriptor {
            system_prompt_text: "You help with orders.".into(),
            voice_style_description: "Warm and concise".into(),
            ..AgentDescriptor::new("a1", "Sam")
        };
        let prompt = agent.system_prompt(Department::Orders, Language::Spanish);
        assert!(prompt.starts_with("You help with orders."));
        assert!(prompt.contains("Warm and concise"));
        assert!(prompt.contains("Order Status"));
        assert!(prompt.contains("Spanish"));

        let fallback = AgentDescriptor::new("a2", "Alex").system_prompt(Department::Sales, Language::English);
        assert!(fallback.contains("You are Alex"));
        assert!(fallback.ends_with("Reply in English."));
    }

    #[test]
    fn test_local_store_returns_blob_reference() {
        let store = LocalRecordingStore::new();
        let url = store.store(RecordedAudio {
            data: Bytes::from_static(b"RIFF"),
            mime_type: "audio/wav",
            sample_rate: 24000,
            duration_ms: 0,
        });
        assert!(url.starts_with(LOCAL_RECORDING_PREFIX));
        assert_eq!(store.get(&url).map(|r| r.data.len()), Some(4));
        assert!(store.get("blob:voicedesk/unknown").is_none());
    }

    #[test]
    fn test_local_store_evicts_oldest() {
        let store = LocalRecordingStore::with_capacity(2);
        let audio = |ms| RecordedAudio {
            data: Bytes::from_static(b"RIFF"),
            mime_type: "audio/wav",
            sample_rate: 24000,
            duration_ms: ms,
        };
        let first = store.store(audio(1));
        let second = store.store(audio(2));
        let third = store.store(audio(3));

        assert_eq!(store.len(), 2);
        assert!(store.get(&first).is_none());
        assert_eq!(store.get(&second).map(|r| r.duration_ms), Some(2));
        assert_eq!(store.get(&third).map(|r| r.duration_ms), Some(3));
    }

    #[tokio::test]
    async fn test_json_history_appends() {
        let path = temp_path();
        let history = JsonFileHistory::new(&path);
        assert!(history.load().await.unwrap().is_empty());

        let agent = AgentDescriptor::new("a", "Agent");
        let first = CallRecord::from_session(&CallSession::new(), &agent, None);
        let second = CallRecord::from_session(&CallSession::new(), &agent, None);
        history.append_call_record(&first).await.unwrap();
        history.append_call_record(&second).await.unwrap();

        let records = history.load().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, first.id);
        assert_eq!(records[1].id, second.id);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn test_memory_history() {
        let history = MemoryCallHistory::new();
        let record = CallRecord::from_session(&CallSession::new(), &AgentDescriptor::default(), None);
        history.append_call_record(&record).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.records()[0], record);
    }
}
