pub mod config;
pub mod corpus;
pub mod crash;
pub mod debug_server;
pub mod ipc;
pub mod payload;
pub mod sanitizer;
pub mod sync;

pub use config::NetfuzzConfig;
pub use corpus::{CorpusEntry, CorpusError, CorpusStore, EntryFactory, EntryOrigin};
pub use crash::{CrashRecord, UNCLASSIFIED_CAUSE};
pub use debug_server::{DebugServerError, DebugServerManager, DebugState, RunSummary};
pub use ipc::{ControlMessage, ControlSink, IpcError, OutputSink};
pub use payload::Payload;
pub use sanitizer::{NoSanitizer, SanitizerLogDirectory, SanitizerReports};
pub use sync::{CorpusSynchronizer, DirectoryObserver, NotifyObserver, ScanObserver, SyncError};
