use thiserror::Error;

use crate::ivr::IvrState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("Microphone access denied: {0}")]
    Permission(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("No response received during {state}")]
    IvrTimeout { state: IvrState },
    #[error("Key '{key}' is not an option in {state}")]
    InvalidInput { key: char, state: IvrState },
    #[error("Recording upload failed: {0}")]
    RecordingUpload(String),
    #[error("Recording failed: {0}")]
    Recording(String),
    #[error("Invalid audio payload: {0}")]
    Codec(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Call engine is not running")]
    EngineStopped,
}

impl CallError {
    /// Fatal errors end the current call; the rest only produce a notification
    /// or a re-prompt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::Permission(_) | CallError::Connection(_) | CallError::EngineStopped
        )
    }

    /// Plain-language line shown to the caller in the transcript.
    pub fn user_message(&self) -> String {
        match self {
            CallError::Permission(_) => {
                "We couldn't access your microphone, so the call was ended.".to_string()
            }
            CallError::Connection(_) => {
                "We couldn't connect you to an agent. Please try calling again.".to_string()
            }
            CallError::IvrTimeout { .. } => {
                "Sorry, we didn't receive a selection. Goodbye.".to_string()
            }
            CallError::InvalidInput { key, .. } => {
                format!("'{}' is not a valid option.", key)
            }
            CallError::RecordingUpload(_) => {
                "The call recording is only available for this session.".to_string()
            }
            CallError::Recording(_) => "The call recording could not be saved.".to_string(),
            CallError::Codec(_) => "Some audio from the agent could not be played.".to_string(),
            CallError::Config(_) => "The call settings could not be loaded.".to_string(),
            CallError::EngineStopped => "The call engine has stopped.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
