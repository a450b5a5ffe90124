//! Durable job store.
//!
//! Layout under the state directory:
//!
//! ```text
//! jobs/<id>.json    current state of every job (write-to-tmp, fsync, rename)
//! journal.jsonl     append-only history of every persisted revision
//! commands/         operator command drop box
//! ```
//!
//! The in-memory index is the only cache of the on-disk records. Every mutation
//! goes through a single mutex so that claim-and-transition in [`JobStore::next_ready`]
//! is atomic for all workers in the process.

use crate::job::{InvalidTransition, JobRecord, JobState};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const JOBS_DIR: &str = "jobs";
const JOURNAL_FILE: &str = "journal.jsonl";
pub const COMMANDS_DIR: &str = "commands";

/// Errors from the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize job {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// A persisted record could not be read back. Systemic.
    #[error("job store is corrupt: {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("source {source_path} already has active job {existing}")]
    Duplicate {
        source_path: PathBuf,
        existing: String,
    },

    #[error("job id {0} already exists")]
    DuplicateId(String),

    #[error("source does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("source path must be absolute: {0}")]
    RelativePath(PathBuf),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} was modified concurrently (expected revision {expected}, found {found})")]
    Conflict { id: String, expected: u64, found: u64 },

    #[error("job {id} is {state} and can no longer change")]
    Terminal { id: String, state: JobState },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("job store was opened read-only")]
    ReadOnly,
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Errors that mean the store itself can no longer be trusted.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            StoreError::Io { .. } | StoreError::Corrupt { .. } | StoreError::Serialize { .. }
        )
    }
}

/// One line of `journal.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub id: String,
    pub state: JobState,
    pub revision: u64,
    pub attempt_count: u32,
}

/// Selection criteria for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub folder: Option<String>,
    pub include_terminal: bool,
}

impl JobFilter {
    pub fn all() -> Self {
        Self {
            include_terminal: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        if let Some(state) = self.state {
            if job.state != state {
                return false;
            }
        } else if !self.include_terminal && job.is_terminal() {
            return false;
        }
        if let Some(folder) = &self.folder {
            if job.folder_name() != Some(folder.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Persistent collection of [`JobRecord`]s.
#[derive(Debug)]
pub struct JobStore {
    root: PathBuf,
    jobs_dir: PathBuf,
    journal_path: PathBuf,
    read_only: bool,
    index: Mutex<BTreeMap<String, JobRecord>>,
}

impl JobStore {
    /// Opens (creating if needed) the store under `state_dir` and loads every record.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let jobs_dir = state_dir.join(JOBS_DIR);
        fs::create_dir_all(&jobs_dir).map_err(|e| StoreError::io(&jobs_dir, e))?;
        let commands = state_dir.join(COMMANDS_DIR);
        fs::create_dir_all(&commands).map_err(|e| StoreError::io(&commands, e))?;

        remove_leftover_tmp(&jobs_dir)?;
        let index = load_index(&jobs_dir)?;
        info!(
            "Opened job store at {} ({} jobs)",
            state_dir.display(),
            index.len()
        );

        Ok(Self {
            root: state_dir.to_path_buf(),
            journal_path: state_dir.join(JOURNAL_FILE),
            jobs_dir,
            read_only: false,
            index: Mutex::new(index),
        })
    }

    /// Opens the store for inspection only. Nothing on disk is touched.
    pub fn open_read_only(state_dir: &Path) -> Result<Self, StoreError> {
        let jobs_dir = state_dir.join(JOBS_DIR);
        let index = if jobs_dir.exists() {
            load_index(&jobs_dir)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            root: state_dir.to_path_buf(),
            journal_path: state_dir.join(JOURNAL_FILE),
            jobs_dir,
            read_only: true,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn commands_dir(&self) -> PathBuf {
        self.root.join(COMMANDS_DIR)
    }

    fn index(&self) -> MutexGuard<'_, BTreeMap<String, JobRecord>> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a new job.
    ///
    /// Rejected when the source is missing or already has a non-terminal record.
    pub fn enqueue(&self, mut job: JobRecord) -> Result<JobRecord, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if !job.source_path.is_absolute() {
            return Err(StoreError::RelativePath(job.source_path));
        }
        if !job.source_path.exists() {
            return Err(StoreError::SourceMissing(job.source_path));
        }

        let mut index = self.index();
        if index.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        if let Some(existing) = index
            .values()
            .find(|j| !j.is_terminal() && j.source_path == job.source_path)
        {
            return Err(StoreError::Duplicate {
                source_path: job.source_path,
                existing: existing.id.clone(),
            });
        }

        job.revision = 1;
        job.touch();
        self.persist(&job)?;
        info!(
            "Job {} enqueued: {} -> {}",
            job.id,
            job.source_path.display(),
            job.destination_path.display()
        );
        index.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Claims the oldest ready job and moves it to `Locked`.
    ///
    /// A claimed job is invisible to every later call until it is put back.
    pub fn next_ready(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut index = self.index();
        let candidate = index
            .values()
            .filter(|j| j.is_ready(now))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned();

        let Some(mut job) = candidate else {
            return Ok(None);
        };

        job.transition(JobState::Locked)?;
        job.revision += 1;
        self.persist(&job)?;
        info!("Job {} claimed (attempt {} of {})", job.id, job.attempt_count + 1, job.max_attempts);
        index.insert(job.id.clone(), job.clone());
        Ok(Some(job))
    }

    /// Atomically replaces a job's record.
    ///
    /// `job.revision` must equal the stored revision; the returned record carries
    /// the incremented revision.
    pub fn update(&self, job: &JobRecord) -> Result<JobRecord, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut index = self.index();
        let stored = index
            .get(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.clone()))?;

        if stored.is_terminal() {
            return Err(StoreError::Terminal {
                id: job.id.clone(),
                state: stored.state,
            });
        }
        if stored.revision != job.revision {
            return Err(StoreError::Conflict {
                id: job.id.clone(),
                expected: job.revision,
                found: stored.revision,
            });
        }
        if stored.state != job.state && !stored.state.can_transition_to(job.state) {
            return Err(InvalidTransition {
                id: job.id.clone(),
                from: stored.state,
                to: job.state,
            }
            .into());
        }
        if job.attempt_count > job.max_attempts {
            return Err(InvalidTransition {
                id: job.id.clone(),
                from: stored.state,
                to: job.state,
            }
            .into());
        }

        let previous = stored.state;
        let mut next = job.clone();
        next.revision = stored.revision + 1;
        next.touch();
        self.persist(&next)?;
        if previous != next.state {
            info!("Job {} {} -> {}", next.id, previous, next.state);
        } else {
            debug!("Job {} updated (revision {})", next.id, next.revision);
        }
        index.insert(next.id.clone(), next.clone());
        Ok(next)
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.index().get(id).cloned()
    }

    /// Looks up a job by full id or by a unique id prefix.
    pub fn resolve(&self, id_or_prefix: &str) -> Result<JobRecord, StoreError> {
        let index = self.index();
        if let Some(job) = index.get(id_or_prefix) {
            return Ok(job.clone());
        }
        let mut matches = index
            .values()
            .filter(|j| !id_or_prefix.is_empty() && j.id.starts_with(id_or_prefix));
        match (matches.next(), matches.next()) {
            (Some(job), None) => Ok(job.clone()),
            _ => Err(StoreError::NotFound(id_or_prefix.to_string())),
        }
    }

    /// Jobs matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .index()
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// The non-terminal job for `path`, if any.
    pub fn active_for_source(&self, path: &Path) -> Option<JobRecord> {
        self.index()
            .values()
            .find(|j| !j.is_terminal() && j.source_path == path)
            .cloned()
    }

    /// Whether any job (terminal or not) was created from this exact file.
    pub fn has_fingerprint(&self, path: &Path, size: u64, modified: Option<DateTime<Utc>>) -> bool {
        self.index()
            .values()
            .any(|j| j.matches_fingerprint(path, size, modified))
    }

    /// History of one job as recorded in the journal.
    pub fn journal_for(&self, id: &str) -> Result<Vec<JournalEntry>, StoreError> {
        let file = match File::open(&self.journal_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.journal_path, e)),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io(&self.journal_path, e))?;
            // A torn last line from a crash is expected; skip anything unparsable.
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(entry) if entry.id == id => entries.push(entry),
                Ok(_) => {}
                Err(e) => debug!("Skipping journal line: {}", e),
            }
        }
        Ok(entries)
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", id))
    }

    /// Writes the record next to its final path, syncs it and renames it into place,
    /// then appends to the journal.
    fn persist(&self, job: &JobRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(job).map_err(|source| StoreError::Serialize {
            id: job.id.clone(),
            source,
        })?;

        let path = self.job_path(&job.id);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(&json).map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        if let Err(e) = File::open(&self.jobs_dir).and_then(|dir| dir.sync_all()) {
            debug!("Directory sync of {} failed: {}", self.jobs_dir.display(), e);
        }

        self.append_journal(job)
    }

    fn append_journal(&self, job: &JobRecord) -> Result<(), StoreError> {
        let entry = JournalEntry {
            at: job.updated_at,
            id: job.id.clone(),
            state: job.state,
            revision: job.revision,
            attempt_count: job.attempt_count,
        };
        let mut line = serde_json::to_string(&entry).map_err(|source| StoreError::Serialize {
            id: job.id.clone(),
            source,
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .map_err(|e| StoreError::io(&self.journal_path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::io(&self.journal_path, e))?;
        file.sync_data()
            .map_err(|e| StoreError::io(&self.journal_path, e))
    }
}

fn remove_leftover_tmp(jobs_dir: &Path) -> Result<(), StoreError> {
    for entry in fs::read_dir(jobs_dir).map_err(|e| StoreError::io(jobs_dir, e))? {
        let path = entry.map_err(|e| StoreError::io(jobs_dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            warn!("Removing interrupted write {}", path.display());
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }
    }
    Ok(())
}

fn load_index(jobs_dir: &Path) -> Result<BTreeMap<String, JobRecord>, StoreError> {
    let mut index = BTreeMap::new();
    for entry in fs::read_dir(jobs_dir).map_err(|e| StoreError::io(jobs_dir, e))? {
        let path = entry.map_err(|e| StoreError::io(jobs_dir, e))?.path();

        // Only process .json files
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let content = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        let job: JobRecord = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let expected = format!("{}.json", job.id);
        if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("record id {} does not match file name", job.id),
            });
        }
        index.insert(job.id.clone(), job);
    }
    Ok(index)
}
