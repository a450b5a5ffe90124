//! Job record model.
//!
//! A [`JobRecord`] is the durable unit of work. Its state machine is enforced
//! here so that every component (monitor, store, scheduler, sink) goes through
//! the same transition table.

use crate::config::{CapabilityRequest, CompletionAction};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Seen in a watch folder, nothing checked yet.
    Discovered,
    /// Being sampled for write stability.
    Stabilizing,
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker, engine not yet resolved.
    Locked,
    /// External tool is running.
    Running,
    /// Output written; waiting for the result sink.
    Completed,
    /// Gave up; waiting for the result sink.
    Failed,
    /// Waiting for `next_retry_at`.
    Retrying,
    /// Terminal: completed and original dispositioned.
    Archived,
    /// Terminal: failed and original moved to the error area.
    Errored,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Queued
    }
}

impl JobState {
    pub const ALL: [JobState; 10] = [
        JobState::Discovered,
        JobState::Stabilizing,
        JobState::Queued,
        JobState::Locked,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Retrying,
        JobState::Archived,
        JobState::Errored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Discovered => "discovered",
            JobState::Stabilizing => "stabilizing",
            JobState::Queued => "queued",
            JobState::Locked => "locked",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::Archived => "archived",
            JobState::Errored => "errored",
        }
    }

    /// Terminal states are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Archived | JobState::Errored)
    }

    /// Claimed by a worker (invisible to `next_ready`).
    pub fn is_claimed(&self) -> bool {
        matches!(self, JobState::Locked | JobState::Running)
    }

    /// Allowed successor states.
    pub fn successors(&self) -> &'static [JobState] {
        use JobState::*;
        match self {
            Discovered => &[Stabilizing, Queued],
            Stabilizing => &[Queued, Discovered],
            Queued => &[Locked, Failed],
            Locked => &[Running, Failed, Queued],
            Running => &[Completed, Failed, Retrying],
            Retrying => &[Locked, Failed],
            Completed => &[Archived],
            Failed => &[Errored],
            Archived | Errored => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        self.successors().contains(&next)
    }

    /// How far along the pipeline a state is. Used to check that recovery never
    /// moves a job forward.
    pub fn progress_rank(&self) -> u8 {
        match self {
            JobState::Discovered => 0,
            JobState::Stabilizing => 1,
            JobState::Queued | JobState::Retrying => 2,
            JobState::Locked => 3,
            JobState::Running => 4,
            JobState::Completed | JobState::Failed => 5,
            JobState::Archived | JobState::Errored => 6,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    /// Permanent, and detected before an attempt was consumed.
    Configuration,
}

/// Structured failure reason stored on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// External tool exceeded its wall-clock limit.
    Timeout,
    /// External tool exited nonzero without a recognised fatal signature.
    ToolFailed,
    /// External tool was killed by a signal we did not send.
    ToolSignalled,
    /// Tool reported success but its output was missing or empty.
    OutputInvalid,
    /// Filesystem contention, e.g. a lock held by a live process.
    FsContention,
    /// The process running the attempt died.
    Interrupted,
    /// Input is unreadable or corrupt.
    CorruptInput,
    /// Input format is not supported by the tool.
    UnsupportedFormat,
    /// The input vanished.
    InputMissing,
    /// No engine for a required capability, or a bad preset.
    Configuration,
    /// Operator cancelled the job.
    Cancelled,
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Timeout
            | ErrorKind::ToolFailed
            | ErrorKind::ToolSignalled
            | ErrorKind::OutputInvalid
            | ErrorKind::FsContention
            | ErrorKind::Interrupted => ErrorClass::Transient,
            ErrorKind::CorruptInput
            | ErrorKind::UnsupportedFormat
            | ErrorKind::InputMissing
            | ErrorKind::Cancelled => ErrorClass::Permanent,
            ErrorKind::Configuration => ErrorClass::Configuration,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ToolFailed => "tool_failed",
            ErrorKind::ToolSignalled => "tool_signalled",
            ErrorKind::OutputInvalid => "output_invalid",
            ErrorKind::FsContention => "fs_contention",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::CorruptInput => "corrupt_input",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::InputMissing => "input_missing",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last error recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Resolved processing configuration (preset + overrides).
///
/// Opaque to the orchestrator: it is copied, persisted and compared, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub preset: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

/// One entry of a job's processing log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Engine chosen for one capability of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedEngine {
    pub capability: crate::config::Capability,
    pub name: String,
    pub priority: u32,
    /// Preferred engine that was unavailable, if this is a substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<String>,
}

/// Where a job came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOrigin {
    Watch { folder: String },
    Api,
}

/// What the result sink does with the original input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    pub on_complete: CompletionAction,
    /// Root the source was discovered under; used to keep relative layout.
    #[serde(default)]
    pub input_root: Option<PathBuf>,
    #[serde(default)]
    pub completed_dir: Option<PathBuf>,
    pub error_dir: PathBuf,
}

/// Error returned when a transition is not in the table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("job {id}: invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: JobState,
    pub to: JobState,
}

/// The durable representation of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub config: ProcessingConfig,
    #[serde(default)]
    pub requirements: Vec<CapabilityRequest>,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
    /// Optimistic concurrency counter, bumped by every store write.
    #[serde(default)]
    pub revision: u64,
    pub origin: JobOrigin,
    pub disposition: Disposition,
    #[serde(default)]
    pub lock_token: Option<String>,
    #[serde(default)]
    pub source_size: u64,
    #[serde(default)]
    pub source_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub engines: Vec<SelectedEngine>,
    #[serde(default)]
    pub progress: Option<f32>,
    /// Where the result sink moved the original input, recorded before the move.
    #[serde(default)]
    pub archived_input: Option<PathBuf>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    /// Fields written by newer versions, kept so a rewrite does not drop them.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Everything needed to construct a fresh record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub config: ProcessingConfig,
    pub requirements: Vec<CapabilityRequest>,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
    pub origin: JobOrigin,
    pub disposition: Disposition,
}

impl JobRecord {
    /// Creates a queued job with a fresh id.
    pub fn new(fields: NewJob) -> Self {
        let now = Utc::now();
        let mut job = Self {
            id: Uuid::new_v4().to_string(),
            source_path: fields.source_path,
            destination_path: fields.destination_path,
            config: fields.config,
            requirements: fields.requirements,
            state: JobState::Queued,
            attempt_count: 0,
            max_attempts: fields.max_attempts.max(1),
            last_error: None,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            retry_delay_secs: fields.retry_delay_secs,
            timeout_secs: fields.timeout_secs,
            revision: 0,
            origin: fields.origin,
            disposition: fields.disposition,
            lock_token: None,
            source_size: 0,
            source_modified: None,
            engines: Vec::new(),
            progress: None,
            archived_input: None,
            log: Vec::new(),
            extra: BTreeMap::new(),
        };
        job.note("created");
        job
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append a message to the processing log.
    pub fn note(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
        self.touch();
    }

    /// Move to `next` if the transition table allows it.
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        let from = self.state;
        self.state = next;
        if next != JobState::Retrying {
            self.next_retry_at = None;
        }
        self.note(format!("{} -> {}", from, next));
        Ok(())
    }

    /// Count a new attempt. Fails if the budget is already spent.
    pub fn begin_attempt(&mut self) -> Result<u32, InvalidTransition> {
        if self.attempt_count >= self.max_attempts {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: JobState::Running,
            });
        }
        self.transition(JobState::Running)?;
        self.attempt_count += 1;
        self.progress = None;
        Ok(self.attempt_count)
    }

    /// Record a failure as the job's last error.
    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let error = JobError::new(kind, message);
        self.note(format!("error: {}", error));
        self.last_error = Some(error);
    }

    /// Park the job until `at`.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Retrying)?;
        self.next_retry_at = Some(at);
        self.note(format!("retry scheduled for {}", at.to_rfc3339()));
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Eligible for `next_ready` at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Queued => true,
            JobState::Retrying => self.next_retry_at.map(|at| at <= now).unwrap_or(true),
            _ => false,
        }
    }

    pub fn retry_delay(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.retry_delay_secs.min(i64::MAX as u64) as i64)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn folder_name(&self) -> Option<&str> {
        match &self.origin {
            JobOrigin::Watch { folder } => Some(folder),
            JobOrigin::Api => None,
        }
    }

    /// Same file as when this record was made?
    pub fn matches_fingerprint(&self, path: &Path, size: u64, modified: Option<DateTime<Utc>>) -> bool {
        self.source_path == path && self.source_size == size && self.source_modified == modified
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn new_job(source: &str) -> JobRecord {
        JobRecord::new(NewJob {
            source_path: PathBuf::from(source),
            destination_path: PathBuf::from("/out/video.mkv"),
            config: ProcessingConfig {
                preset: "film".to_string(),
                overrides: BTreeMap::new(),
            },
            requirements: Vec::new(),
            max_attempts: 3,
            retry_delay_secs: 5,
            timeout_secs: 60,
            origin: JobOrigin::Api,
            disposition: Disposition {
                on_complete: CompletionAction::Preserve,
                input_root: None,
                completed_dir: None,
                error_dir: PathBuf::from("/errors"),
            },
        })
    }

    #[test]
    fn test_job_state_display_round_trips() {
        for state in JobState::ALL {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = new_job("/in/a.mkv");
        assert_eq!(job.id.len(), 36);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.revision, 0);
        assert!(job.last_error.is_none());
        assert_eq!(job.log.len(), 1);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = new_job("/in/a.mkv");
        job.transition(JobState::Locked).unwrap();
        assert_eq!(job.begin_attempt().unwrap(), 1);
        job.transition(JobState::Completed).unwrap();
        job.transition(JobState::Archived).unwrap();
        assert!(job.is_terminal());
        assert!(job.transition(JobState::Errored).is_err());
    }

    #[test]
    fn test_begin_attempt_respects_budget() {
        let mut job = new_job("/in/a.mkv");
        job.max_attempts = 1;
        job.transition(JobState::Locked).unwrap();
        job.begin_attempt().unwrap();
        job.schedule_retry(Utc::now()).unwrap();
        job.transition(JobState::Locked).unwrap();
        let err = job.begin_attempt().unwrap_err();
        assert_eq!(err.to, JobState::Running);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.state, JobState::Locked);
    }

    #[test]
    fn test_is_ready_honours_next_retry_at() {
        let mut job = new_job("/in/a.mkv");
        let now = Utc::now();
        assert!(job.is_ready(now));

        job.transition(JobState::Locked).unwrap();
        assert!(!job.is_ready(now));

        job.begin_attempt().unwrap();
        job.schedule_retry(now + ChronoDuration::seconds(5)).unwrap();
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + ChronoDuration::seconds(5)));
    }

    #[test]
    fn test_error_classes() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::ToolFailed.is_transient());
        assert!(ErrorKind::FsContention.is_transient());
        assert_eq!(ErrorKind::CorruptInput.class(), ErrorClass::Permanent);
        assert_eq!(ErrorKind::Cancelled.class(), ErrorClass::Permanent);
        assert_eq!(ErrorKind::Configuration.class(), ErrorClass::Configuration);
    }

    #[test]
    fn test_unknown_fields_survive_a_rewrite() {
        let job = new_job("/in/a.mkv");
        let mut value = serde_json::to_value(&job).unwrap();
        value["gpu_affinity"] = serde_json::json!({ "device": 1 });

        let parsed: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.extra["gpu_affinity"]["device"], 1);

        let rewritten = serde_json::to_value(&parsed).unwrap();
        assert_eq!(rewritten["gpu_affinity"]["device"], 1);
    }

    fn state_strategy() -> impl Strategy<Value = JobState> {
        proptest::sample::select(JobState::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // Terminal states accept no transition at all.
        #[test]
        fn prop_terminal_states_are_final(from in state_strategy(), to in state_strategy()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        // Whatever sequence of transitions is attempted, attempt_count never
        // passes max_attempts.
        #[test]
        fn prop_attempts_never_exceed_budget(
            max_attempts in 1u32..6,
            steps in proptest::collection::vec(state_strategy(), 0..60),
        ) {
            let mut job = new_job("/in/a.mkv");
            job.max_attempts = max_attempts;
            for step in steps {
                if step == JobState::Running {
                    let _ = job.begin_attempt();
                } else {
                    let _ = job.transition(step);
                }
                prop_assert!(job.attempt_count <= job.max_attempts);
            }
        }
    }
}
