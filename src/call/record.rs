use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ports::AgentDescriptor;
use super::session::{now_ms, CallSession, TranscriptLine};
use crate::ivr::Department;

/// Screen a call was placed from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    /// Test call from the agent builder
    #[default]
    InlineTest,
    /// Simulated call from the call history screen
    HistorySimulation,
}

/// Finished call as handed to persistence
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub source: EntryPoint,
    pub department: Option<Department>,
    /// ms since the Unix epoch
    pub start_time: u64,
    pub end_time: u64,
    /// Seconds
    pub duration: u64,
    pub transcript: Vec<TranscriptLine>,
    pub recording_url: Option<String>,
}

impl CallRecord {
    pub fn from_session(
        session: &CallSession,
        agent: &AgentDescriptor,
        recording_url: Option<String>,
    ) -> Self {
        let start_time = session.started_at.unwrap_or_else(now_ms);
        let end_time = session.ended_at.unwrap_or_else(now_ms).max(start_time);
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            source: session.source.unwrap_or_default(),
            department: session.department,
            start_time,
            end_time,
            duration: (end_time - start_time) / 1000,
            transcript: session.transcript.clone(),
            recording_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::{CallStatus, Speaker};

    #[test]
    fn test_record_copies_session() {
        let agent = AgentDescriptor::new("agent-1", "Riley");
        let mut session = CallSession {
            status: CallStatus::Connected,
            started_at: Some(10_000),
            source: Some(EntryPoint::HistorySimulation),
            department: Some(Department::Billing),
            ..CallSession::default()
        };
        session.append(Speaker::Agent, "Hello");
        session.ended_at = Some(75_400);

        let record = CallRecord::from_session(&session, &agent, Some("blob:x".into()));
        assert_eq!(record.agent_id, "agent-1");
        assert_eq!(record.agent_name, "Riley");
        assert_eq!(record.duration, 65);
        assert_eq!(record.source, EntryPoint::HistorySimulation);
        assert_eq!(record.transcript.len(), 1);
        assert_eq!(record.recording_url.as_deref(), Some("blob:x"));
        assert!(Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let agent = AgentDescriptor::new("a", "b");
        let record = CallRecord::from_session(&CallSession::new(), &agent, None);
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("agentId").is_some());
        assert!(value.get("recordingUrl").is_some());
        assert_eq!(value["source"], "inline_test");
    }
}
