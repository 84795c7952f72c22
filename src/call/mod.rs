mod controller;
pub mod ports;
mod record;
mod session;

pub use controller::{CallController, CallDeps, CallHandle};
pub use ports::{
    AgentDescriptor, CallObserver, CallUpdate, JsonFileHistory, LocalRecordingStore, LogNotifier,
    MemoryCallHistory, NotificationSink, NullObserver, ObjectStorage, PersistenceSink, Severity,
};
pub use record::{CallRecord, EntryPoint};
pub use session::{now_ms, CallSession, CallStatus, Speaker, TranscriptLine};
