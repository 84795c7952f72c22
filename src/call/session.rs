use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::record::EntryPoint;
use crate::ivr::{Department, IvrState, Language};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Connecting,
    Connected,
    Ended,
}

impl CallStatus {
    /// Connecting or connected
    pub fn is_live(&self) -> bool {
        matches!(self, CallStatus::Connecting | CallStatus::Connected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Agent,
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub speaker: Speaker,
    pub text: String,
    /// Wall-clock receipt time, ms since the Unix epoch
    pub timestamp: u64,
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Runtime state of the current phone call.
///
/// Only the call controller writes it; everyone else gets snapshots.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CallSession {
    pub status: CallStatus,
    pub ivr_state: IvrState,
    pub dialed_digits: String,
    pub department: Option<Department>,
    pub language: Option<Language>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub source: Option<EntryPoint>,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub muted: bool,
    pub on_hold: bool,
    pub ambience: bool,
    pub transcript: Vec<TranscriptLine>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self {
            status: CallStatus::Idle,
            ivr_state: IvrState::Idle,
            dialed_digits: String::new(),
            department: None,
            language: None,
            agent_id: None,
            agent_name: None,
            source: None,
            started_at: None,
            ended_at: None,
            muted: false,
            on_hold: false,
            ambience: false,
            transcript: Vec::new(),
        }
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            (Some(start), None) => now_ms().saturating_sub(start),
            _ => 0,
        }
    }

    /// Append a transcript line stamped with the current time.
    /// Ended calls are frozen and return `None`.
    pub fn append(&mut self, speaker: Speaker, text: impl Into<String>) -> Option<TranscriptLine> {
        if self.status == CallStatus::Ended {
            return None;
        }
        let line = TranscriptLine {
            speaker,
            text: text.into(),
            timestamp: now_ms(),
        };
        self.transcript.push(line.clone());
        Some(line)
    }

    /// Menu state only moves while the call is connecting
    pub fn set_ivr_state(&mut self, state: IvrState) -> bool {
        if self.status != CallStatus::Connecting || self.ivr_state == state {
            return false;
        }
        self.ivr_state = state;
        true
    }

    pub fn press_digit(&mut self, key: char) {
        if self.status.is_live() {
            self.dialed_digits.push(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ended_session_is_frozen() {
        let mut session = CallSession::new();
        session.status = CallStatus::Connecting;
        assert!(session.append(Speaker::System, "Ringing").is_some());

        session.status = CallStatus::Ended;
        assert!(session.append(Speaker::Agent, "late fragment").is_none());
        assert!(!session.set_ivr_state(IvrState::MainMenu));
        session.press_digit('1');
        assert_eq!(session.transcript.len(), 1);
        assert!(session.dialed_digits.is_empty());
    }

    #[test]
    fn test_ivr_state_frozen_once_connected() {
        let mut session = CallSession::new();
        session.status = CallStatus::Connecting;
        assert!(session.set_ivr_state(IvrState::ConnectedToAgent));
        session.status = CallStatus::Connected;
        assert!(!session.set_ivr_state(IvrState::Ended));
        assert_eq!(session.ivr_state, IvrState::ConnectedToAgent);
    }

    #[test]
    fn test_duration() {
        let session = CallSession {
            started_at: Some(1_000),
            ended_at: Some(4_500),
            ..CallSession::default()
        };
        assert_eq!(session.duration_ms(), 3_500);
        assert_eq!(CallSession::new().duration_ms(), 0);
    }
}
