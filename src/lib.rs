//! Simulated phone calls to AI customer-service agents: an IVR menu in front
//! of a realtime voice session, with local playback, recording and a live
//! spectrum for the UI.

pub mod audio;
pub mod call;
#[cfg(feature = "tauri")]
pub mod commands;
pub mod config;
pub mod error;
pub mod ivr;
pub mod session;
pub mod visualizer;
pub mod voices;

pub use call::{
    AgentDescriptor, CallController, CallDeps, CallHandle, CallRecord, CallSession, CallStatus,
    CallUpdate, EntryPoint,
};
#[cfg(feature = "tauri")]
pub use commands::init;
pub use config::CallConfig;
pub use error::{CallError, Result};

/// Install the fmt subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}
