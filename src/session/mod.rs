//! Realtime voice session with the remote conversational agent
//!
//! A [`VoiceConnector`] performs the handshake and hands back a
//! [`SessionHandle`] for outbound microphone audio. Everything the service
//! sends arrives as [`SessionEvent`]s on the channel given at open.

pub mod protocol;
mod websocket;

pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::PcmBuffer;
use crate::error::{CallError, Result};
use crate::ivr::{Department, Language};

/// Parameters for opening a session
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRequest {
    pub department: Department,
    pub language: Language,
    /// Provider voice identifier
    pub voice: String,
    pub system_prompt: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Agent speech, already at the output rate
    Audio(PcmBuffer),
    CallerTranscript(String),
    AgentTranscript(String),
    /// The caller barged in; pending agent audio must stop
    Interrupted,
    TurnComplete,
    /// Remote side ended the session normally
    Closed { reason: Option<String> },
    Failed(CallError),
}

pub type SessionEvents = mpsc::UnboundedSender<SessionEvent>;

/// Frames queued for the service
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundFrame {
    /// One capture block at the input rate
    Audio(Vec<f32>),
    Close,
}

#[async_trait]
pub trait VoiceConnector: Send + Sync {
    /// Open a duplex session. Missing credentials and rejected handshakes
    /// are `CallError::Connection`.
    async fn open(&self, request: SessionRequest, events: SessionEvents) -> Result<SessionHandle>;
}

/// Exclusive handle on an open session
pub struct SessionHandle {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            outbound,
            reader: None,
            closed: false,
        }
    }

    /// Handle plus the receiving end a connector's writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Task reading from the service, aborted when the handle closes
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn is_open(&self) -> bool {
        !self.closed && !self.outbound.is_closed()
    }

    /// Queue a microphone block. Returns false once the session is gone.
    pub fn send_audio(&self, samples: Vec<f32>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbound.send(OutboundFrame::Audio(samples)).is_ok()
    }

    /// Close the stream. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.send(OutboundFrame::Close);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        tracing::info!("Voice session closed");
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut handle, mut rx) = SessionHandle::channel();
        assert!(handle.send_audio(vec![0.0; 4]));
        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert!(!handle.send_audio(vec![0.0; 4]));
        drop(handle);

        assert_eq!(rx.recv().await, Some(OutboundFrame::Audio(vec![0.0; 4])));
        assert_eq!(rx.recv().await, Some(OutboundFrame::Close));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_handle_reports_dropped_writer() {
        let (handle, rx) = SessionHandle::channel();
        drop(rx);
        assert!(!handle.is_open());
        assert!(!handle.send_audio(vec![0.0]));
    }

    #[tokio::test]
    async fn test_close_aborts_reader() {
        let reader = tokio::spawn(std::future::pending::<()>());
        let (handle, _rx) = SessionHandle::channel();
        let mut handle = handle.with_reader(reader);
        handle.close();
        let task = handle.reader.take();
        assert!(task.is_none());
    }
}
