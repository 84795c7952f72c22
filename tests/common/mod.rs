#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use voicedesk_lib::audio::device::CaptureSender;
use voicedesk_lib::audio::{
    ActiveStream, AudioBackend, HeadlessBackend, RecordedAudio, ScheduledChunk, SharedMixer,
};
use voicedesk_lib::call::{
    AgentDescriptor, CallHandle, CallObserver, CallRecord, CallStatus, CallUpdate, MemoryCallHistory,
    NotificationSink, ObjectStorage, Severity,
};
use voicedesk_lib::ivr::{Prompt, PromptPlayer};
use voicedesk_lib::session::{
    OutboundFrame, SessionEvent, SessionEvents, SessionHandle, SessionRequest, VoiceConnector,
};
use voicedesk_lib::{CallConfig, CallController, CallDeps, CallError};

/// Every announcement takes the same time
pub struct FixedPrompts(pub Duration);

#[async_trait]
impl PromptPlayer for FixedPrompts {
    async fn play(&self, _prompt: &Prompt, _output: &SharedMixer) {
        tokio::time::sleep(self.0).await;
    }
}

/// Voice service double: records requests and lets the test push events
#[derive(Default)]
pub struct ScriptedConnector {
    pub fail_with: Option<CallError>,
    requests: Mutex<Vec<SessionRequest>>,
    events: Mutex<Option<SessionEvents>>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<OutboundFrame>>>,
}

impl ScriptedConnector {
    pub fn failing(error: CallError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<SessionRequest> {
        self.requests.lock().clone()
    }

    pub fn push(&self, event: SessionEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Frames sent since the last call
    pub fn drain_outbound(&self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        if let Some(rx) = self.outbound.lock().as_mut() {
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }
}

#[async_trait]
impl VoiceConnector for ScriptedConnector {
    async fn open(
        &self,
        request: SessionRequest,
        events: SessionEvents,
    ) -> voicedesk_lib::Result<SessionHandle> {
        self.requests.lock().push(request);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        let (handle, outbound) = SessionHandle::channel();
        *self.events.lock() = Some(events);
        *self.outbound.lock() = Some(outbound);
        Ok(handle)
    }
}

/// Collects every update except spectrum frames
#[derive(Default)]
pub struct Updates {
    updates: Mutex<Vec<CallUpdate>>,
}

impl CallObserver for Updates {
    fn on_update(&self, update: CallUpdate) {
        if !matches!(update, CallUpdate::Spectrum(_)) {
            self.updates.lock().push(update);
        }
    }
}

impl Updates {
    pub fn all(&self) -> Vec<CallUpdate> {
        self.updates.lock().clone()
    }

    pub fn speech(&self) -> Vec<ScheduledChunk> {
        self.all()
            .into_iter()
            .filter_map(|u| match u {
                CallUpdate::AgentSpeech(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    pub fn interruptions(&self) -> Vec<(f64, usize)> {
        self.all()
            .into_iter()
            .filter_map(|u| match u {
                CallUpdate::Interrupted { at, cancelled } => Some((at, cancelled)),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<CallStatus> {
        self.all()
            .into_iter()
            .filter_map(|u| match u {
                CallUpdate::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn finalized(&self) -> Vec<Option<CallRecord>> {
        self.all()
            .into_iter()
            .filter_map(|u| match u {
                CallUpdate::Finalized { record } => Some(record),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<(String, Severity)> {
        self.all()
            .into_iter()
            .filter_map(|u| match u {
                CallUpdate::Notification { message, severity } => Some((message, severity)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
pub struct Notices {
    pub messages: Mutex<Vec<(String, Severity)>>,
}

impl NotificationSink for Notices {
    fn notify(&self, message: &str, severity: Severity) {
        self.messages.lock().push((message.to_string(), severity));
    }
}

pub struct FailingStorage;

#[async_trait]
impl ObjectStorage for FailingStorage {
    async fn upload(&self, _recording: &RecordedAudio) -> Result<String, String> {
        Err("bucket unavailable".to_string())
    }
}

/// Headless audio that keeps everything sent to the speaker
#[derive(Default)]
pub struct TappedBackend {
    deny_microphone: bool,
    rendered: Arc<Mutex<Vec<f32>>>,
    speaker_stopped: Arc<AtomicBool>,
}

impl TappedBackend {
    pub fn denied() -> Self {
        Self {
            deny_microphone: true,
            ..Self::default()
        }
    }

    /// Loudest sample among the last `ms` of output
    pub fn recent_peak(&self, ms: usize) -> f32 {
        let rendered = self.rendered.lock();
        let from = rendered.len().saturating_sub(ms * 24);
        rendered[from..].iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    pub fn speaker_stopped(&self) -> bool {
        self.speaker_stopped.load(Ordering::SeqCst)
    }
}

struct SpeakerTap {
    task: Option<tokio::task::JoinHandle<()>>,
    stopped: Arc<AtomicBool>,
}

impl ActiveStream for SpeakerTap {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.stopped.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for SpeakerTap {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioBackend for TappedBackend {
    fn open_input(
        &self,
        sample_rate: u32,
        block_size: usize,
        frames: CaptureSender,
    ) -> voicedesk_lib::Result<Box<dyn ActiveStream>> {
        if self.deny_microphone {
            return Err(CallError::Permission("blocked by the user".to_string()));
        }
        HeadlessBackend::default().open_input(sample_rate, block_size, frames)
    }

    fn open_output(&self, mixer: SharedMixer) -> voicedesk_lib::Result<Box<dyn ActiveStream>> {
        let rendered = self.rendered.clone();
        self.speaker_stopped.store(false, Ordering::SeqCst);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(20));
            let mut frame = vec![0.0f32; 480];
            interval.tick().await;
            loop {
                interval.tick().await;
                mixer.lock().render(&mut frame);
                rendered.lock().extend_from_slice(&frame);
            }
        });
        Ok(Box::new(SpeakerTap {
            task: Some(task),
            stopped: self.speaker_stopped.clone(),
        }))
    }
}

pub struct Engine {
    pub handle: CallHandle,
    pub connector: Arc<ScriptedConnector>,
    pub history: Arc<MemoryCallHistory>,
    pub updates: Arc<Updates>,
    pub notices: Arc<Notices>,
}

/// Half-second prompts on top of the default IVR timings
pub const PROMPT: Duration = Duration::from_millis(500);

pub fn engine(connector: ScriptedConnector) -> Engine {
    engine_with(connector, |deps| deps)
}

pub fn engine_with(
    connector: ScriptedConnector,
    customize: impl FnOnce(CallDeps) -> CallDeps,
) -> Engine {
    let connector = Arc::new(connector);
    let history = Arc::new(MemoryCallHistory::new());
    let updates = Arc::new(Updates::default());
    let notices = Arc::new(Notices::default());
    let deps = CallDeps::new(CallConfig::default(), connector.clone())
        .with_prompt_player(Arc::new(FixedPrompts(PROMPT)))
        .with_persistence(history.clone())
        .with_observer(updates.clone())
        .with_notifier(notices.clone());
    let handle = CallController::spawn(customize(deps));
    Engine {
        handle,
        connector,
        history,
        updates,
        notices,
    }
}

pub fn agent() -> AgentDescriptor {
    AgentDescriptor {
        voice_profile: "Professional".to_string(),
        system_prompt_text: "You are Riley from Acme support.".to_string(),
        ..AgentDescriptor::new("agent-7", "Riley")
    }
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Ring out and let the language prompt finish (t = 8.5s)
pub async fn answer(engine: &Engine) {
    engine
        .handle
        .start_call(agent(), Default::default())
        .unwrap();
    sleep_ms(8_600).await;
}

/// Choose English and a department, then wait for the agent
pub async fn connect(engine: &Engine, department_key: char) {
    answer(engine).await;
    engine.handle.press_key('1').unwrap();
    sleep_ms(600).await;
    engine.handle.press_key(department_key).unwrap();
    // connecting prompt, routing delay, handshake
    sleep_ms(2_000).await;
}
