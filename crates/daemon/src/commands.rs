//! Operator commands.
//!
//! The CLI never touches job records of a running daemon directly. It drops a
//! JSON file into `state_dir/commands/` and the daemon applies it on its next
//! pass. Each file is deleted once handled, whether or not it could be applied.

use crate::config::{CapabilityRequest, CompletionAction, Config};
use crate::job::{Disposition, ErrorKind, JobOrigin, JobRecord, JobState, NewJob, ProcessingConfig};
use crate::lock::{LockError, LockManager, LockOutcome};
use crate::scheduler::CancelRegistry;
use crate::sink::{ResultSink, SinkError};
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const API_MAX_RETRIES: u32 = 3;
const API_RETRY_DELAY_SECS: u64 = 60;
const API_ERROR_DIR: &str = "errors";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{0}")]
    Rejected(String),
}

impl CommandError {
    fn io(path: &Path, source: io::Error) -> Self {
        CommandError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_systemic(&self) -> bool {
        match self {
            CommandError::Store(e) | CommandError::Sink(SinkError::Store(e)) => e.is_systemic(),
            _ => false,
        }
    }
}

/// One operator request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Make a retrying job ready now, or start over from an errored job's input.
    Retry { job_id: String },
    /// Stop a job; a running tool is killed.
    Cancel { job_id: String },
    /// Direct submission of a file.
    Submit {
        source: PathBuf,
        destination: PathBuf,
        #[serde(default = "default_preset")]
        preset: String,
        #[serde(default)]
        overrides: BTreeMap<String, String>,
        #[serde(default)]
        capabilities: Vec<CapabilityRequest>,
        #[serde(default)]
        max_retries: Option<u32>,
        #[serde(default)]
        retry_delay_secs: Option<u64>,
    },
}

fn default_preset() -> String {
    "default".to_string()
}

/// Writes `command` into `dir` atomically and returns the file's path.
pub fn write_command(dir: &Path, command: &Command) -> Result<PathBuf, CommandError> {
    fs::create_dir_all(dir).map_err(|e| CommandError::io(dir, e))?;
    let name = format!(
        "{}-{}.json",
        Utc::now().format("%Y%m%dT%H%M%S%.6f"),
        Uuid::new_v4().simple()
    );
    let path = dir.join(name);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(command)?;
    fs::write(&tmp, json).map_err(|e| CommandError::io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| CommandError::io(&path, e))?;
    Ok(path)
}

/// Settings for jobs that do not come from a watch folder.
#[derive(Debug, Clone)]
pub struct ApiDefaults {
    pub timeout_secs: u64,
    pub error_dir: PathBuf,
}

impl ApiDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout_secs: config.scheduler.job_timeout_secs,
            error_dir: config.state.state_dir.join(API_ERROR_DIR),
        }
    }
}

/// Result of applying one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Retried(JobRecord),
    /// An errored job was started over as a new job.
    Resubmitted(JobRecord),
    Cancelled(JobRecord),
    /// The job's worker was told to stop; it records the outcome itself.
    CancelSignalled(String),
    Submitted(JobRecord),
}

/// Applies command files against the store.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    store: Arc<JobStore>,
    locks: LockManager,
    sink: ResultSink,
    cancels: CancelRegistry,
    api: ApiDefaults,
}

impl CommandProcessor {
    pub fn new(
        store: Arc<JobStore>,
        locks: LockManager,
        sink: ResultSink,
        cancels: CancelRegistry,
        api: ApiDefaults,
    ) -> Self {
        Self {
            store,
            locks,
            sink,
            cancels,
            api,
        }
    }

    /// Handles every pending command file, oldest first. Returns how many were applied.
    ///
    /// A command that cannot be applied is logged and dropped; only systemic
    /// store errors are returned.
    pub fn process_pending(&self) -> Result<usize, CommandError> {
        let dir = self.store.commands_dir();
        let mut files: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
                .collect(),
            Err(e) => {
                debug!("Failed to read command directory {}: {}", dir.display(), e);
                return Ok(0);
            }
        };
        files.sort();

        let mut applied = 0;
        for path in files {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| serde_json::from_str::<Command>(&content).map_err(|e| e.to_string()));
            let result = match parsed {
                Ok(command) => self.apply(command),
                Err(e) => Err(CommandError::Rejected(format!(
                    "unreadable command file {}: {}",
                    path.display(),
                    e
                ))),
            };

            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove command file {}: {}", path.display(), e);
            }

            match result {
                Ok(outcome) => {
                    debug!("Applied {}: {:?}", path.display(), outcome);
                    applied += 1;
                }
                Err(e) if e.is_systemic() => return Err(e),
                Err(e) => warn!("Command {} not applied: {}", path.display(), e),
            }
        }
        Ok(applied)
    }

    pub fn apply(&self, command: Command) -> Result<Applied, CommandError> {
        match command {
            Command::Retry { job_id } => self.retry(&job_id),
            Command::Cancel { job_id } => self.cancel(&job_id),
            Command::Submit {
                source,
                destination,
                preset,
                overrides,
                capabilities,
                max_retries,
                retry_delay_secs,
            } => {
                let max_retries = max_retries.unwrap_or(API_MAX_RETRIES);
                let job = JobRecord::new(NewJob {
                    source_path: source,
                    destination_path: destination,
                    config: ProcessingConfig { preset, overrides },
                    requirements: capabilities,
                    max_attempts: max_retries.saturating_add(1),
                    retry_delay_secs: retry_delay_secs.unwrap_or(API_RETRY_DELAY_SECS),
                    timeout_secs: self.api.timeout_secs,
                    origin: JobOrigin::Api,
                    disposition: Disposition {
                        on_complete: CompletionAction::Preserve,
                        input_root: None,
                        completed_dir: None,
                        error_dir: self.api.error_dir.clone(),
                    },
                });
                self.submit(job).map(Applied::Submitted)
            }
        }
    }

    /// Locks the job's input and enqueues it.
    pub fn submit(&self, mut job: JobRecord) -> Result<JobRecord, CommandError> {
        if !job.source_path.is_absolute() || !job.destination_path.is_absolute() {
            return Err(CommandError::Rejected(
                "source and destination must be absolute paths".to_string(),
            ));
        }
        if job.source_path == job.destination_path {
            return Err(CommandError::Rejected(
                "source and destination are the same file".to_string(),
            ));
        }
        let metadata = fs::metadata(&job.source_path)
            .map_err(|e| CommandError::io(&job.source_path, e))?;

        let handle = match self.locks.acquire(&job.source_path)? {
            LockOutcome::Acquired(handle) => handle,
            LockOutcome::AlreadyLocked(owner) => {
                return Err(CommandError::Rejected(format!(
                    "{} is locked by pid {}",
                    job.source_path.display(),
                    owner.map(|o| o.pid.to_string()).unwrap_or_else(|| "?".to_string())
                )));
            }
        };
        job.lock_token = Some(handle.token.clone());
        job.source_size = metadata.len();
        job.source_modified = crate::stability::FileSample::from_metadata(&metadata).modified;

        match self.store.enqueue(job) {
            Ok(job) => Ok(job),
            Err(e) => {
                self.locks.release(&handle)?;
                Err(e.into())
            }
        }
    }

    fn retry(&self, id: &str) -> Result<Applied, CommandError> {
        let mut job = self.store.resolve(id)?;
        match job.state {
            JobState::Retrying => {
                let now = Utc::now();
                job.next_retry_at = Some(now);
                job.note("retry requested by operator");
                info!("Job {}: retry forced", job.id);
                Ok(Applied::Retried(self.store.update(&job)?))
            }
            JobState::Errored => {
                let Some(input) = job.archived_input.clone().filter(|p| p.exists()) else {
                    return Err(CommandError::Rejected(format!(
                        "job {} has no input left to retry",
                        job.id
                    )));
                };
                let mut disposition = job.disposition.clone();
                disposition.input_root = input.parent().map(Path::to_path_buf);
                let mut fresh = JobRecord::new(NewJob {
                    source_path: input,
                    destination_path: job.destination_path.clone(),
                    config: job.config.clone(),
                    requirements: job.requirements.clone(),
                    max_attempts: job.max_attempts,
                    retry_delay_secs: job.retry_delay_secs,
                    timeout_secs: job.timeout_secs,
                    origin: job.origin.clone(),
                    disposition,
                });
                fresh.note(format!("resubmitted from errored job {}", job.id));
                let fresh = self.submit(fresh)?;
                info!("Job {}: resubmitted as {}", job.id, fresh.id);
                Ok(Applied::Resubmitted(fresh))
            }
            state => Err(CommandError::Rejected(format!(
                "job {} is {}; only retrying or errored jobs can be retried",
                job.id, state
            ))),
        }
    }

    fn cancel(&self, id: &str) -> Result<Applied, CommandError> {
        let mut job = self.store.resolve(id)?;
        match job.state {
            JobState::Queued | JobState::Retrying | JobState::Locked => {
                job.record_error(ErrorKind::Cancelled, "cancelled by operator");
                job.transition(JobState::Failed)
                    .map_err(|e| CommandError::Store(e.into()))?;
                let job = self.store.update(&job)?;
                info!("Job {}: cancelled", job.id);
                Ok(Applied::Cancelled(self.sink.finalize(&job.id)?))
            }
            JobState::Running => {
                if self.cancels.cancel(&job.id) {
                    info!("Job {}: cancellation signalled to its worker", job.id);
                    Ok(Applied::CancelSignalled(job.id))
                } else {
                    Err(CommandError::Rejected(format!(
                        "job {} is running but not in this process",
                        job.id
                    )))
                }
            }
            state => Err(CommandError::Rejected(format!(
                "job {} is {} and cannot be cancelled",
                job.id, state
            ))),
        }
    }
}
