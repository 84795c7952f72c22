//! Automated phone menu that runs before a caller reaches the voice agent
//!
//! The machine is pure: it consumes one [`IvrEvent`] at a time and returns
//! the [`IvrAction`]s the call controller must carry out. Every state entry
//! bumps an epoch; timers carry the epoch they were armed in and are ignored
//! once it is stale, so a timer from a state that has been left can never
//! act on a newer state.

mod menu;
mod player;

pub use menu::{Department, Language, Prompt};
pub use player::{
    ChimePromptPlayer, ClipPromptPlayer, HostSpeechPlayer, PromptPlayer, SpeechRequest, SpeechSink,
    SPEECH_GRACE,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::IvrTimings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IvrState {
    Idle,
    Ringing,
    LanguageSelect,
    MainMenu,
    Routing,
    ConnectedToAgent,
    Ended,
}

impl IvrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IvrState::Idle => "idle",
            IvrState::Ringing => "ringing",
            IvrState::LanguageSelect => "language_select",
            IvrState::MainMenu => "main_menu",
            IvrState::Routing => "routing",
            IvrState::ConnectedToAgent => "connected_to_agent",
            IvrState::Ended => "ended",
        }
    }

    /// States that wait for a keypress
    pub fn is_menu(&self) -> bool {
        matches!(self, IvrState::LanguageSelect | IvrState::MainMenu)
    }
}

impl fmt::Display for IvrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Epoch = u64;
pub type PromptId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Ringback finished, the menu picks up
    Ring,
    /// Caller stayed silent in a menu
    NoInput,
    /// Pause between the connecting announcement and opening the session
    RoutingDelay,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IvrEvent {
    Start,
    Timer { kind: TimerKind, epoch: Epoch },
    PromptFinished { id: PromptId },
    KeyPress(char),
    SessionOpened,
    SessionFailed,
    Hangup,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IvrAction {
    StartRingback,
    StopRingback,
    PlayPrompt { id: PromptId, prompt: Prompt },
    ArmTimer {
        kind: TimerKind,
        after: Duration,
        epoch: Epoch,
    },
    CancelTimers,
    OpenSession {
        department: Department,
        language: Language,
    },
    InvalidKey { key: char, state: IvrState },
    /// The menu gave up waiting for the caller
    NoInputHangup { state: IvrState },
}

/// What happens once the current prompt has finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AfterPrompt {
    AwaitInput,
    ReplayMenu,
    Goodbye,
    RoutingDelay,
}

pub struct IvrMachine {
    timings: IvrTimings,
    state: IvrState,
    epoch: Epoch,
    next_prompt: PromptId,
    playing: Option<(PromptId, AfterPrompt)>,
    queued_key: Option<char>,
    language: Option<Language>,
    department: Option<Department>,
    retries_used: u32,
}

impl IvrMachine {
    pub fn new(timings: IvrTimings) -> Self {
        Self {
            timings,
            state: IvrState::Idle,
            epoch: 0,
            next_prompt: 0,
            playing: None,
            queued_key: None,
            language: None,
            department: None,
            retries_used: 0,
        }
    }

    pub fn state(&self) -> IvrState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn language(&self) -> Option<Language> {
        self.language
    }

    pub fn department(&self) -> Option<Department> {
        self.department
    }

    pub fn is_prompt_playing(&self) -> bool {
        self.playing.is_some()
    }

    pub fn queued_key(&self) -> Option<char> {
        self.queued_key
    }

    pub fn handle(&mut self, event: IvrEvent) -> Vec<IvrAction> {
        let mut actions = Vec::new();
        match event {
            IvrEvent::Start => {
                if self.state == IvrState::Idle {
                    self.enter(IvrState::Ringing, &mut actions);
                    actions.push(IvrAction::StartRingback);
                    self.arm(TimerKind::Ring, self.timings.ring_duration(), &mut actions);
                }
            }
            IvrEvent::Timer { kind, epoch } => {
                if epoch != self.epoch {
                    tracing::debug!("Ignoring stale {:?} timer from epoch {}", kind, epoch);
                    return actions;
                }
                self.on_timer(kind, &mut actions);
            }
            IvrEvent::PromptFinished { id } => match self.playing {
                Some((playing, after)) if playing == id => {
                    self.playing = None;
                    self.on_prompt_finished(after, &mut actions);
                }
                _ => tracing::trace!("Ignoring completion of prompt {}", id),
            },
            IvrEvent::KeyPress(key) => self.on_key(key, &mut actions),
            IvrEvent::SessionOpened => {
                if self.state == IvrState::Routing {
                    self.enter(IvrState::ConnectedToAgent, &mut actions);
                }
            }
            IvrEvent::SessionFailed | IvrEvent::Hangup => {
                if self.state != IvrState::Ended {
                    if self.state == IvrState::Ringing {
                        actions.push(IvrAction::StopRingback);
                    }
                    self.enter(IvrState::Ended, &mut actions);
                }
            }
        }
        actions
    }

    fn on_timer(&mut self, kind: TimerKind, actions: &mut Vec<IvrAction>) {
        match (self.state, kind) {
            (IvrState::Ringing, TimerKind::Ring) => {
                actions.push(IvrAction::StopRingback);
                self.enter(IvrState::LanguageSelect, actions);
                self.play(Prompt::LanguageMenu, AfterPrompt::AwaitInput, actions);
            }
            (state, TimerKind::NoInput) if state.is_menu() => {
                self.invalidate(actions);
                if self.retries_used < self.timings.no_input_retries {
                    self.retries_used += 1;
                    self.play(
                        Prompt::NoInputRetry(self.language),
                        AfterPrompt::ReplayMenu,
                        actions,
                    );
                } else {
                    self.play(
                        Prompt::NoInputGoodbye(self.language),
                        AfterPrompt::Goodbye,
                        actions,
                    );
                }
            }
            (IvrState::Routing, TimerKind::RoutingDelay) => {
                if let (Some(department), Some(language)) = (self.department, self.language) {
                    actions.push(IvrAction::OpenSession {
                        department,
                        language,
                    });
                }
            }
            (state, kind) => {
                tracing::debug!("{:?} timer has no effect in {}", kind, state);
            }
        }
    }

    fn on_prompt_finished(&mut self, after: AfterPrompt, actions: &mut Vec<IvrAction>) {
        match after {
            AfterPrompt::AwaitInput => match self.queued_key.take() {
                Some(key) => self.accept_key(key, actions),
                None => {
                    let timeout = self.input_timeout();
                    self.arm(TimerKind::NoInput, timeout, actions);
                }
            },
            AfterPrompt::ReplayMenu => {
                if let Some(prompt) = self.menu_prompt() {
                    self.play(prompt, AfterPrompt::AwaitInput, actions);
                }
            }
            AfterPrompt::Goodbye => {
                let state = self.state;
                self.enter(IvrState::Ended, actions);
                actions.push(IvrAction::NoInputHangup { state });
            }
            AfterPrompt::RoutingDelay => {
                self.arm(TimerKind::RoutingDelay, self.timings.routing_delay(), actions);
            }
        }
    }

    fn on_key(&mut self, key: char, actions: &mut Vec<IvrAction>) {
        if !self.state.is_menu() {
            tracing::trace!("Key '{}' ignored in {}", key, self.state);
            return;
        }
        match self.playing {
            Some((_, AfterPrompt::AwaitInput | AfterPrompt::ReplayMenu)) => {
                // Held until the machine starts listening; only the first key counts
                if self.queued_key.is_none() {
                    tracing::debug!("Queued key '{}' until the prompt finishes", key);
                    self.queued_key = Some(key);
                }
            }
            Some(_) => tracing::trace!("Key '{}' ignored during announcement", key),
            None => self.accept_key(key, actions),
        }
    }

    fn accept_key(&mut self, key: char, actions: &mut Vec<IvrAction>) {
        match self.state {
            IvrState::LanguageSelect => match Language::from_key(key) {
                Some(language) => {
                    self.language = Some(language);
                    self.retries_used = 0;
                    self.enter(IvrState::MainMenu, actions);
                    self.play(Prompt::MainMenu(language), AfterPrompt::AwaitInput, actions);
                }
                None => self.reject_key(key, actions),
            },
            IvrState::MainMenu => match Department::from_key(key) {
                Some(department) => {
                    let language = self.language.unwrap_or(Language::English);
                    self.language = Some(language);
                    self.department = Some(department);
                    self.enter(IvrState::Routing, actions);
                    self.play(
                        Prompt::Connecting(department, language),
                        AfterPrompt::RoutingDelay,
                        actions,
                    );
                }
                None => self.reject_key(key, actions),
            },
            _ => {}
        }
    }

    fn reject_key(&mut self, key: char, actions: &mut Vec<IvrAction>) {
        self.invalidate(actions);
        actions.push(IvrAction::InvalidKey {
            key,
            state: self.state,
        });
        self.play(
            Prompt::InvalidOption(self.language),
            AfterPrompt::ReplayMenu,
            actions,
        );
    }

    fn enter(&mut self, state: IvrState, actions: &mut Vec<IvrAction>) {
        tracing::info!("IVR {} -> {}", self.state, state);
        self.state = state;
        self.playing = None;
        self.queued_key = None;
        self.invalidate(actions);
    }

    /// Outdate every timer armed so far
    fn invalidate(&mut self, actions: &mut Vec<IvrAction>) {
        self.epoch += 1;
        actions.push(IvrAction::CancelTimers);
    }

    fn arm(&mut self, kind: TimerKind, after: Duration, actions: &mut Vec<IvrAction>) {
        actions.push(IvrAction::ArmTimer {
            kind,
            after,
            epoch: self.epoch,
        });
    }

    fn play(&mut self, prompt: Prompt, after: AfterPrompt, actions: &mut Vec<IvrAction>) {
        let id = self.next_prompt;
        self.next_prompt += 1;
        self.playing = Some((id, after));
        actions.push(IvrAction::PlayPrompt { id, prompt });
    }

    fn menu_prompt(&self) -> Option<Prompt> {
        match self.state {
            IvrState::LanguageSelect => Some(Prompt::LanguageMenu),
            IvrState::MainMenu => Some(Prompt::MainMenu(
                self.language.unwrap_or(Language::English),
            )),
            _ => None,
        }
    }

    fn input_timeout(&self) -> Duration {
        match self.state {
            IvrState::MainMenu => self.timings.menu_timeout(),
            _ => self.timings.language_timeout(),
        }
    }
}
