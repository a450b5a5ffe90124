//! reelwatch
//!
//! Job orchestration for long-running external media transcodes: watch-folder
//! ingestion with stability detection and input locks, a durable job store,
//! engine selection with fallback, fixed-delay retries and result disposition.

pub mod commands;
pub mod concurrency;
pub mod engine;
pub mod job;
pub mod lock;
pub mod marker;
pub mod monitor;
pub mod orchestrator;
pub mod retry;
pub mod scan;
pub mod scheduler;
pub mod sink;
pub mod stability;
pub mod store;
pub mod transcode;

pub use reelwatch_config as config;
pub use reelwatch_config::Config;

pub use commands::{write_command, Command, CommandError, CommandProcessor};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use engine::{registry, EngineDescriptor, EngineProbe, EngineSelector, SelectionError};
pub use job::{ErrorClass, ErrorKind, JobError, JobRecord, JobState};
pub use lock::{LockError, LockHandle, LockManager, LockOutcome};
pub use monitor::{CandidateOutcome, MonitorError, WatchFolderMonitor};
pub use orchestrator::{check, daemon_lock_path, running_daemon_pid, Orchestrator, OrchestratorError};
pub use retry::{decide, RetryDecision};
pub use scheduler::{CancelRegistry, SchedulerError, Worker, WorkerContext};
pub use sink::{ResultSink, SinkError};
pub use stability::{StabilityDetector, StabilityOutcome};
pub use store::{JobFilter, JobStore, StoreError};
pub use transcode::{CommandTranscoder, ExitReport, TranscodeRequest, Transcoder};
