//! Call lifecycle and recording
//!
//! A single controller task owns the active call. Commands from the UI and
//! completions from timers, prompts, the microphone and the voice session
//! all arrive on one queue and are handled one at a time, so the IVR machine
//! and the call state never see concurrent mutation. Every event produced on
//! behalf of a call carries its sequence number; events from a call that has
//! already ended are dropped.
//!
//! Only `CallHandle`s keep the queue alive. Tasks spawned for a call hold a
//! weak sender, so dropping the last handle ends the live call and stops the
//! controller.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ports::{
    AgentDescriptor, CallObserver, CallUpdate, LocalRecordingStore, LogNotifier,
    MemoryCallHistory, NotificationSink, NullObserver, ObjectStorage, PersistenceSink, Severity,
};
use super::record::{CallRecord, EntryPoint};
use super::session::{now_ms, CallSession, CallStatus, Speaker};
use crate::audio::recorder::stop_recording;
use crate::audio::tones::{dtmf_frequencies, DTMF_TONE_MS};
use crate::audio::{
    ActiveStream, AudioBackend, HeadlessBackend, LoopKind, OutputMixer, PlaybackScheduler,
    RecordedAudio, SessionRecorder, SharedMixer, SharedRecorder, ToneSynth,
};
use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::ivr::{
    ChimePromptPlayer, ClipPromptPlayer, Epoch, IvrAction, IvrEvent, IvrMachine, IvrState, Language, Prompt,
    PromptId, PromptPlayer, TimerKind,
};
use crate::session::{SessionEvent, SessionHandle, SessionRequest, VoiceConnector};
use crate::visualizer::spawn_visualizer;
use crate::voices::provider_voice;

/// Collaborators of the call engine
pub struct CallDeps {
    pub config: CallConfig,
    pub backend: Arc<dyn AudioBackend>,
    pub connector: Arc<dyn VoiceConnector>,
    pub prompts: Arc<dyn PromptPlayer>,
    pub persistence: Arc<dyn PersistenceSink>,
    pub notifier: Arc<dyn NotificationSink>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub observer: Arc<dyn CallObserver>,
}

impl CallDeps {
    /// Headless audio, chime prompts, in-memory history and log notifications
    pub fn new(config: CallConfig, connector: Arc<dyn VoiceConnector>) -> Self {
        let backend = Arc::new(HeadlessBackend::new(config.audio.render_frame_ms));
        let prompts: Arc<dyn PromptPlayer> = match &config.audio.prompt_clip_dir {
            Some(dir) => Arc::new(ClipPromptPlayer::new(dir, config.audio.tone_volume)),
            None => Arc::new(ChimePromptPlayer::new(160, config.audio.tone_volume)),
        };
        Self {
            config,
            backend,
            connector,
            prompts,
            persistence: Arc::new(MemoryCallHistory::new()),
            notifier: Arc::new(LogNotifier),
            storage: None,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn AudioBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_prompt_player(mut self, prompts: Arc<dyn PromptPlayer>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = observer;
        self
    }
}

enum CallEvent {
    Start {
        agent: AgentDescriptor,
        source: EntryPoint,
    },
    End,
    KeyPress(char),
    ToggleMute,
    ToggleHold,
    ToggleAmbience,
    SetVolume(f32),
    Timer {
        call: u64,
        kind: TimerKind,
        epoch: Epoch,
    },
    PromptFinished {
        call: u64,
        id: PromptId,
    },
    SessionReady {
        call: u64,
        result: Result<SessionHandle>,
    },
    Session {
        call: u64,
        event: SessionEvent,
    },
    Capture {
        call: u64,
        samples: Vec<f32>,
    },
}

enum EndReason {
    Hangup,
    RemoteClosed(Option<String>),
    NoInput(IvrState),
    Failed(CallError),
}

type EventSender = mpsc::WeakUnboundedSender<CallEvent>;

/// Deliver an event unless the controller is gone
fn post(events: &EventSender, event: CallEvent) -> bool {
    match events.upgrade() {
        Some(tx) => tx.send(event).is_ok(),
        None => false,
    }
}

/// Pending IVR timers of the active call
#[derive(Default)]
struct TimerSet {
    handles: Vec<JoinHandle<()>>,
}

impl TimerSet {
    fn arm(&mut self, after: Duration, event: CallEvent, events: EventSender) {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            post(&events, event);
        }));
    }

    fn cancel_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// Every resource held by one call. Released by `teardown`, which also
/// runs on drop.
struct ActiveCall {
    seq: u64,
    agent: AgentDescriptor,
    ivr: IvrMachine,
    synth: ToneSynth,
    mixer: SharedMixer,
    recorder: SharedRecorder,
    scheduler: PlaybackScheduler,
    timers: TimerSet,
    prompt: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    input: Option<Box<dyn ActiveStream>>,
    output: Option<Box<dyn ActiveStream>>,
    session: Option<SessionHandle>,
    reached_agent: bool,
    released: bool,
}

impl ActiveCall {
    fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.timers.cancel_all();
        if let Some(prompt) = self.prompt.take() {
            prompt.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        if let Some(mut input) = self.input.take() {
            input.stop();
        }
        self.mixer.lock().clear();
        if let Some(mut output) = self.output.take() {
            output.stop();
        }
        self.scheduler.reset();
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Cheap handle for driving the controller from the UI
#[derive(Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<CallEvent>,
    session: Arc<RwLock<CallSession>>,
    history: Arc<RwLock<Vec<CallRecord>>>,
    recordings: Arc<LocalRecordingStore>,
}

impl CallHandle {
    fn send(&self, event: CallEvent) -> Result<()> {
        self.events.send(event).map_err(|_| CallError::EngineStopped)
    }

    /// Ignored while another call is connecting or connected
    pub fn start_call(&self, agent: AgentDescriptor, source: EntryPoint) -> Result<()> {
        self.send(CallEvent::Start { agent, source })
    }

    /// Safe to call repeatedly
    pub fn end_call(&self) -> Result<()> {
        self.send(CallEvent::End)
    }

    pub fn press_key(&self, key: char) -> Result<()> {
        self.send(CallEvent::KeyPress(key))
    }

    pub fn toggle_mute(&self) -> Result<()> {
        self.send(CallEvent::ToggleMute)
    }

    pub fn toggle_hold(&self) -> Result<()> {
        self.send(CallEvent::ToggleHold)
    }

    pub fn toggle_ambience(&self) -> Result<()> {
        self.send(CallEvent::ToggleAmbience)
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.send(CallEvent::SetVolume(volume))
    }

    pub fn snapshot(&self) -> CallSession {
        self.session.read().clone()
    }

    /// Records of calls completed in this process
    pub fn history(&self) -> Vec<CallRecord> {
        self.history.read().clone()
    }

    /// Recording kept locally because it was not uploaded
    pub fn local_recording(&self, url: &str) -> Option<RecordedAudio> {
        self.recordings.get(url)
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }
}

pub struct CallController {
    deps: CallDeps,
    events: EventSender,
    session: Arc<RwLock<CallSession>>,
    history: Arc<RwLock<Vec<CallRecord>>>,
    recordings: Arc<LocalRecordingStore>,
    active: Option<ActiveCall>,
    next_seq: u64,
    volume: f32,
}

impl CallController {
    /// Start the controller task. It runs until every handle is dropped.
    pub fn spawn(deps: CallDeps) -> CallHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CallHandle {
            events: tx,
            session: Arc::new(RwLock::new(CallSession::new())),
            history: Arc::new(RwLock::new(Vec::new())),
            recordings: Arc::new(LocalRecordingStore::new()),
        };
        let controller = CallController {
            volume: deps.config.audio.master_volume,
            deps,
            events: handle.events.downgrade(),
            session: handle.session.clone(),
            history: handle.history.clone(),
            recordings: handle.recordings.clone(),
            active: None,
            next_seq: 0,
        };
        tokio::spawn(controller.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CallEvent>) {
        tracing::info!("Call controller started");
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        self.end_call(EndReason::Hangup);
        tracing::info!("Call controller stopped");
    }

    fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Start { agent, source } => self.start_call(agent, source),
            CallEvent::End => self.end_call(EndReason::Hangup),
            CallEvent::KeyPress(key) => self.press_key(key),
            CallEvent::ToggleMute => self.toggle_mute(),
            CallEvent::ToggleHold => self.toggle_hold(),
            CallEvent::ToggleAmbience => self.toggle_ambience(),
            CallEvent::SetVolume(volume) => self.set_volume(volume),
            CallEvent::Timer { call, kind, epoch } => {
                if self.is_current(call) {
                    self.drive_ivr(IvrEvent::Timer { kind, epoch });
                }
            }
            CallEvent::PromptFinished { call, id } => {
                if self.is_current(call) {
                    self.drive_ivr(IvrEvent::PromptFinished { id });
                }
            }
            CallEvent::SessionReady { call, result } => self.on_session_ready(call, result),
            CallEvent::Session { call, event } => {
                if self.is_current(call) {
                    self.on_session_event(event);
                }
            }
            CallEvent::Capture { call, samples } => {
                if self.is_current(call) {
                    self.on_capture(samples);
                }
            }
        }
    }

    fn is_current(&self, call: u64) -> bool {
        self.active.as_ref().map(|c| c.seq) == Some(call)
    }

    fn emit(&self, update: CallUpdate) {
        self.deps.observer.on_update(update);
    }

    fn notify(&self, message: &str, severity: Severity) {
        notify(&*self.deps.notifier, &*self.deps.observer, message, severity);
    }

    fn append(&self, speaker: Speaker, text: impl Into<String>) {
        let line = self.session.write().append(speaker, text);
        if let Some(line) = line {
            self.emit(CallUpdate::Transcript(line));
        }
    }

    /// Feedback for the call control buttons
    fn click(&self) {
        let volume = self.deps.config.audio.tone_volume;
        if let Some(call) = self.active.as_ref() {
            call.mixer.lock().play_once(call.synth.key_click(), volume);
        }
    }

    fn emit_flags(&self) {
        let (muted, on_hold, ambience) = {
            let session = self.session.read();
            (session.muted, session.on_hold, session.ambience)
        };
        self.emit(CallUpdate::Flags {
            muted,
            on_hold,
            ambience,
        });
    }

    fn start_call(&mut self, agent: AgentDescriptor, source: EntryPoint) {
        if self.session.read().status.is_live() {
            tracing::warn!("A call is already in progress, ignoring start");
            return;
        }
        self.next_seq += 1;
        let audio = &self.deps.config.audio;
        let mixer = OutputMixer::shared(audio.output_sample_rate);
        let recorder = SessionRecorder::new(audio.input_sample_rate, audio.output_sample_rate)
            .limited(audio.max_recording_secs)
            .into_shared();
        {
            let mut mixer = mixer.lock();
            mixer.set_master_volume(self.volume);
            mixer.set_recorder(Some(recorder.clone()));
        }

        tracing::info!("Starting call with {} ({:?})", agent.name, source);
        *self.session.write() = CallSession {
            status: CallStatus::Connecting,
            agent_id: Some(agent.id.clone()),
            agent_name: Some(agent.name.clone()),
            source: Some(source),
            started_at: Some(now_ms()),
            ..CallSession::default()
        };
        self.active = Some(ActiveCall {
            seq: self.next_seq,
            agent,
            ivr: IvrMachine::new(self.deps.config.ivr.clone()),
            synth: ToneSynth::new(audio.output_sample_rate),
            mixer,
            recorder,
            scheduler: PlaybackScheduler::new(),
            timers: TimerSet::default(),
            prompt: None,
            tasks: Vec::new(),
            input: None,
            output: None,
            session: None,
            reached_agent: false,
            released: false,
        });
        self.emit(CallUpdate::Status(CallStatus::Connecting));
        self.emit_flags();

        if let Err(e) = self.open_devices() {
            self.end_call(EndReason::Failed(e));
            return;
        }
        if self.deps.config.audio.ambience_on_start {
            self.toggle_ambience();
        }
        self.drive_ivr(IvrEvent::Start);
    }

    /// Speaker first so a failure tone can still be heard, then microphone
    fn open_devices(&mut self) -> Result<()> {
        let events = self.events.clone();
        let audio = self.deps.config.audio.clone();
        let visualizer = self.deps.config.visualizer.clone();
        let observer = self.deps.observer.clone();
        let backend = self.deps.backend.clone();
        let call = self.active.as_mut().ok_or(CallError::EngineStopped)?;

        call.output = Some(backend.open_output(call.mixer.clone())?);

        let (capture_tx, mut capture_rx) = mpsc::unbounded_channel();
        call.input = Some(backend.open_input(
            audio.input_sample_rate,
            audio.capture_block_size,
            capture_tx,
        )?);

        let seq = call.seq;
        call.tasks.push(tokio::spawn(async move {
            while let Some(samples) = capture_rx.recv().await {
                if !post(&events, CallEvent::Capture { call: seq, samples }) {
                    break;
                }
            }
        }));
        call.tasks.push(spawn_visualizer(
            call.mixer.clone(),
            visualizer,
            move |frame| observer.on_update(CallUpdate::Spectrum(frame)),
        ));
        Ok(())
    }

    fn drive_ivr(&mut self, event: IvrEvent) {
        let actions = match self.active.as_mut() {
            Some(call) => call.ivr.handle(event),
            None => return,
        };
        self.sync_ivr_state();
        for action in actions {
            if self.active.is_none() {
                break;
            }
            self.apply(action);
        }
    }

    fn sync_ivr_state(&mut self) {
        let Some(call) = self.active.as_ref() else {
            return;
        };
        let state = call.ivr.state();
        let changed = {
            let mut session = self.session.write();
            if let Some(language) = call.ivr.language() {
                session.language = Some(language);
            }
            session.set_ivr_state(state)
        };
        if changed {
            self.emit(CallUpdate::Ivr(state));
        }
    }

    fn apply(&mut self, action: IvrAction) {
        let events = self.events.clone();
        let ringback_volume = self.deps.config.audio.ringback_volume;
        let Some(call) = self.active.as_mut() else {
            return;
        };
        match action {
            IvrAction::StartRingback => {
                let cycle = call.synth.ringback_cycle();
                call.mixer
                    .lock()
                    .start_loop(LoopKind::Ringback, cycle, ringback_volume);
            }
            IvrAction::StopRingback => call.mixer.lock().stop_loop(LoopKind::Ringback),
            IvrAction::PlayPrompt { id, prompt } => self.play_prompt(id, prompt, events),
            IvrAction::ArmTimer { kind, after, epoch } => {
                let event = CallEvent::Timer {
                    call: call.seq,
                    kind,
                    epoch,
                };
                call.timers.arm(after, event, events);
            }
            IvrAction::CancelTimers => call.timers.cancel_all(),
            IvrAction::OpenSession {
                department,
                language,
            } => {
                {
                    let mut session = self.session.write();
                    session.department = Some(department);
                    session.language = Some(language);
                }
                let audio = &self.deps.config.audio;
                let request = SessionRequest {
                    department,
                    language,
                    voice: provider_voice(&call.agent.voice_profile).to_string(),
                    system_prompt: call.agent.system_prompt(department, language),
                    input_sample_rate: audio.input_sample_rate,
                    output_sample_rate: audio.output_sample_rate,
                };
                let (session_tx, mut session_rx) = mpsc::unbounded_channel();
                let seq = call.seq;

                let forward = events.clone();
                call.tasks.push(tokio::spawn(async move {
                    while let Some(event) = session_rx.recv().await {
                        if !post(&forward, CallEvent::Session { call: seq, event }) {
                            break;
                        }
                    }
                }));

                let connector = self.deps.connector.clone();
                call.tasks.push(tokio::spawn(async move {
                    let result = connector.open(request, session_tx).await;
                    post(&events, CallEvent::SessionReady { call: seq, result });
                }));
            }
            IvrAction::InvalidKey { key, state } => {
                tracing::info!("{}", CallError::InvalidInput { key, state });
            }
            IvrAction::NoInputHangup { state } => self.end_call(EndReason::NoInput(state)),
        }
    }

    fn play_prompt(&mut self, id: PromptId, prompt: Prompt, events: EventSender) {
        self.append(Speaker::System, prompt.text());
        let player = self.deps.prompts.clone();
        let Some(call) = self.active.as_mut() else {
            return;
        };
        if let Some(previous) = call.prompt.take() {
            previous.abort();
        }
        let mixer = call.mixer.clone();
        let seq = call.seq;
        call.prompt = Some(tokio::spawn(async move {
            player.play(&prompt, &mixer).await;
            post(&events, CallEvent::PromptFinished { call: seq, id });
        }));
    }

    fn press_key(&mut self, key: char) {
        let status = self.session.read().status;
        if !status.is_live() {
            return;
        }
        if dtmf_frequencies(key).is_none() {
            tracing::debug!("Ignoring non-keypad key '{}'", key);
            return;
        }
        let digits = {
            let mut session = self.session.write();
            session.press_digit(key);
            session.dialed_digits.clone()
        };
        self.emit(CallUpdate::Digits(digits));

        let volume = self.deps.config.audio.tone_volume;
        if let Some(call) = self.active.as_ref() {
            if let Some(tone) = call.synth.dtmf(key, DTMF_TONE_MS) {
                call.mixer.lock().play_once(tone, volume);
            }
        }
        if status == CallStatus::Connecting {
            self.drive_ivr(IvrEvent::KeyPress(key));
        }
    }

    fn toggle_mute(&mut self) {
        {
            let mut session = self.session.write();
            if !session.status.is_live() || session.on_hold {
                return;
            }
            session.muted = !session.muted;
            tracing::info!("Microphone {}", if session.muted { "muted" } else { "unmuted" });
        }
        self.click();
        self.emit_flags();
    }

    /// Hold plays music and forces the microphone muted until released
    fn toggle_hold(&mut self) {
        let on_hold = {
            let mut session = self.session.write();
            if session.status != CallStatus::Connected {
                return;
            }
            session.on_hold = !session.on_hold;
            session.muted = session.on_hold;
            session.on_hold
        };
        let volume = self.deps.config.audio.hold_music_volume;
        if let Some(call) = self.active.as_ref() {
            let mut mixer = call.mixer.lock();
            if on_hold {
                mixer.start_loop(LoopKind::HoldMusic, call.synth.hold_music_loop(), volume);
            } else {
                mixer.stop_loop(LoopKind::HoldMusic);
            }
        }
        tracing::info!("Call {}", if on_hold { "on hold" } else { "resumed" });
        self.click();
        self.emit_flags();
    }

    fn toggle_ambience(&mut self) {
        let ambience = {
            let mut session = self.session.write();
            if !session.status.is_live() {
                return;
            }
            session.ambience = !session.ambience;
            session.ambience
        };
        let volume = self.deps.config.audio.ambience_volume;
        if let Some(call) = self.active.as_ref() {
            if ambience {
                let bed = call.synth.ambience_loop(8, rand::random());
                call.mixer.lock().start_loop(LoopKind::Ambience, bed, volume);
            } else {
                call.mixer.lock().stop_loop(LoopKind::Ambience);
            }
        }
        self.emit_flags();
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(call) = self.active.as_ref() {
            call.mixer.lock().set_master_volume(self.volume);
        }
    }

    fn on_session_ready(&mut self, call: u64, result: Result<SessionHandle>) {
        if !self.is_current(call) {
            if let Ok(mut stale) = result {
                tracing::debug!("Closing session opened for a call that already ended");
                stale.close();
            }
            return;
        }
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                self.end_call(EndReason::Failed(e));
                return;
            }
        };

        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.session = Some(handle);
        active.reached_agent = true;
        let department = active.ivr.department();
        self.drive_ivr(IvrEvent::SessionOpened);

        self.session.write().status = CallStatus::Connected;
        tracing::info!("Caller connected to agent");
        self.emit(CallUpdate::Status(CallStatus::Connected));
        if let Some(department) = department {
            let language = self.session.read().language.unwrap_or(Language::English);
            self.append(
                Speaker::System,
                format!("Connected to {}.", department.display_name(language)),
            );
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        if !self.session.read().status.is_live() {
            return;
        }
        match event {
            SessionEvent::Audio(buffer) => {
                let Some(call) = self.active.as_mut() else {
                    return;
                };
                let chunk = {
                    let mut mixer = call.mixer.lock();
                    let buffer = buffer.into_rate(mixer.sample_rate());
                    let now = mixer.clock_secs();
                    call.scheduler.reap(now);
                    let chunk = call.scheduler.schedule(now, buffer.duration_secs());
                    mixer.schedule_voice(chunk.id, chunk.start, buffer.samples);
                    chunk
                };
                tracing::trace!("Agent audio scheduled at {:.3}s", chunk.start);
                self.emit(CallUpdate::AgentSpeech(chunk));
            }
            SessionEvent::Interrupted => {
                let Some(call) = self.active.as_mut() else {
                    return;
                };
                let (at, cancelled) = {
                    let mut mixer = call.mixer.lock();
                    let now = mixer.clock_secs();
                    let ids = call.scheduler.interrupt(now);
                    mixer.cancel_voice(&ids);
                    (now, ids.len())
                };
                tracing::debug!("Caller interrupted the agent, {} chunks cancelled", cancelled);
                self.emit(CallUpdate::Interrupted { at, cancelled });
            }
            SessionEvent::CallerTranscript(text) => self.append(Speaker::Caller, text),
            SessionEvent::AgentTranscript(text) => self.append(Speaker::Agent, text),
            SessionEvent::TurnComplete => tracing::trace!("Agent turn complete"),
            SessionEvent::Closed { reason } => self.end_call(EndReason::RemoteClosed(reason)),
            SessionEvent::Failed(e) => self.end_call(EndReason::Failed(e)),
        }
    }

    /// Muted audio is captured but neither sent nor recorded
    fn on_capture(&mut self, samples: Vec<f32>) {
        if self.session.read().muted {
            return;
        }
        let Some(call) = self.active.as_ref() else {
            return;
        };
        if let Some(recorder) = call.recorder.lock().as_mut() {
            recorder.push_caller(&samples);
        }
        if let Some(session) = &call.session {
            if !session.send_audio(samples) {
                tracing::trace!("Voice session no longer accepts audio");
            }
        }
    }

    fn end_call(&mut self, reason: EndReason) {
        let Some(mut call) = self.active.take() else {
            return;
        };
        if !self.session.read().status.is_live() {
            return;
        }

        call.ivr.handle(IvrEvent::Hangup);
        let ivr_changed = self.session.write().set_ivr_state(IvrState::Ended);
        if ivr_changed {
            self.emit(CallUpdate::Ivr(IvrState::Ended));
        }

        let fatal = match &reason {
            EndReason::Hangup => {
                tracing::info!("Call ended by caller");
                false
            }
            EndReason::RemoteClosed(reason) => {
                tracing::info!(
                    "Voice service ended the call: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.append(Speaker::System, "The agent ended the call.");
                false
            }
            EndReason::NoInput(state) => {
                tracing::info!("{}", CallError::IvrTimeout { state: *state });
                false
            }
            EndReason::Failed(e) => {
                tracing::error!("Call failed: {}", e);
                self.append(Speaker::System, e.user_message());
                self.notify(&e.to_string(), Severity::Error);
                e.is_fatal()
            }
        };

        {
            let mut session = self.session.write();
            session.status = CallStatus::Ended;
            session.ended_at = Some(now_ms());
        }
        self.emit(CallUpdate::Status(CallStatus::Ended));

        let output = if fatal { call.output.take() } else { None };
        call.teardown();
        if let Some(output) = output {
            let tone = call.synth.failure_tone();
            let length = Duration::from_secs_f64(tone.len() as f64 / call.synth.sample_rate() as f64);
            call.mixer
                .lock()
                .play_once(tone, self.deps.config.audio.tone_volume);
            drain_output(output, length);
        }

        self.finalize(&call);
    }

    /// Hand the call to persistence once its recording is stored
    fn finalize(&self, call: &ActiveCall) {
        let observer = self.deps.observer.clone();
        if !call.reached_agent {
            tracing::info!("Call never reached an agent, no record kept");
            call.recorder.lock().take();
            observer.on_update(CallUpdate::Finalized { record: None });
            return;
        }

        let snapshot = self.session.read().clone();
        let agent = call.agent.clone();
        let recorder = call.recorder.clone();
        let storage = self.deps.storage.clone();
        let persistence = self.deps.persistence.clone();
        let notifier = self.deps.notifier.clone();
        let recordings = self.recordings.clone();
        let history = self.history.clone();

        tokio::spawn(async move {
            let recording = tokio::task::spawn_blocking(move || stop_recording(&recorder))
                .await
                .ok()
                .flatten();
            let recording_url = match recording {
                Some(Ok(audio)) => Some(
                    store_recording(storage, &recordings, audio, &*notifier, &*observer).await,
                ),
                Some(Err(e)) => {
                    tracing::warn!("{}", e);
                    notify(&*notifier, &*observer, &e.user_message(), Severity::Warning);
                    None
                }
                None => None,
            };

            let record = CallRecord::from_session(&snapshot, &agent, recording_url);
            history.write().push(record.clone());
            if let Err(e) = persistence.append_call_record(&record).await {
                tracing::warn!("Failed to persist call record {}: {}", record.id, e);
                notify(
                    &*notifier,
                    &*observer,
                    "The call could not be saved to history.",
                    Severity::Warning,
                );
            }
            tracing::info!("Call record {} created ({}s)", record.id, record.duration);
            observer.on_update(CallUpdate::Finalized {
                record: Some(record),
            });
        });
    }
}

fn notify(notifier: &dyn NotificationSink, observer: &dyn CallObserver, message: &str, severity: Severity) {
    notifier.notify(message, severity);
    observer.on_update(CallUpdate::Notification {
        message: message.to_string(),
        severity,
    });
}

/// Upload, or keep a session-scoped copy when there is no storage or the
/// upload fails
async fn store_recording(
    storage: Option<Arc<dyn ObjectStorage>>,
    local: &LocalRecordingStore,
    audio: RecordedAudio,
    notifier: &dyn NotificationSink,
    observer: &dyn CallObserver,
) -> String {
    if let Some(storage) = storage {
        match storage.upload(&audio).await {
            Ok(url) => {
                tracing::info!("Recording uploaded ({} ms)", audio.duration_ms);
                return url;
            }
            Err(e) => {
                let error = CallError::RecordingUpload(e);
                tracing::warn!("{}", error);
                notify(notifier, observer, &error.user_message(), Severity::Warning);
            }
        }
    }
    local.store(audio)
}

/// Keep the speaker open until the failure tone has played
fn drain_output(mut output: Box<dyn ActiveStream>, length: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(length).await;
        output.stop();
    });
}
