//! Result sink: final disposition of original inputs.
//!
//! Runs once a job is `Completed` or `Failed`. For completed jobs the input is
//! moved to the completed area, deleted, or left alone behind a `.done` marker;
//! for failed jobs it is moved to the error area next to a `.error.txt` report.
//! The lock is released and the job reaches its terminal state.
//!
//! Every step is safe to repeat. The move target is persisted on the record
//! before the move happens, so a rerun after a crash finds the same target.

use crate::config::CompletionAction;
use crate::job::{JobRecord, JobState};
use crate::lock::{LockError, LockManager};
use crate::marker::{write_done_marker, DoneMarker};
use crate::scan::error_report_path;
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use log::{debug, info, warn};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while dispositioning a job.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("job {id} is {state}; only completed or failed jobs can be finalized")]
    NotFinished { id: String, state: JobState },

    #[error("result sink task failed: {0}")]
    Join(String),
}

impl SinkError {
    fn io(path: &Path, source: io::Error) -> Self {
        SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Moves `from` to `to`, falling back to copy + remove across filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<(), SinkError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;
    }
    // Try to rename first (faster, same filesystem)
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| SinkError::io(to, e))?;
    fs::File::open(to)
        .and_then(|f| f.sync_all())
        .map_err(|e| SinkError::io(to, e))?;
    fs::remove_file(from).map_err(|e| SinkError::io(from, e))
}

/// `target` if free, otherwise `stem.1.ext`, `stem.2.ext`, ...
pub fn unique_path(target: &Path) -> PathBuf {
    if !target.exists() {
        return target.to_path_buf();
    }
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = target.extension().map(|e| e.to_string_lossy().into_owned());
    (1u32..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{}.{}.{}", stem, n, ext),
                None => format!("{}.{}", stem, n),
            };
            target.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| target.to_path_buf())
}

/// Where `source` goes inside `area`, keeping its layout below `input_root`.
fn area_target(source: &Path, input_root: Option<&Path>, area: &Path) -> PathBuf {
    let relative = input_root
        .and_then(|root| source.strip_prefix(root).ok())
        .map(Path::to_path_buf)
        .or_else(|| source.file_name().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("input"));
    area.join(relative)
}

/// Human-readable failure report.
pub fn render_report(job: &JobRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "reelwatch job report");
    let _ = writeln!(out);
    let _ = writeln!(out, "job:          {}", job.id);
    let _ = writeln!(out, "source:       {}", job.source_path.display());
    let _ = writeln!(out, "destination:  {}", job.destination_path.display());
    let _ = writeln!(out, "preset:       {}", job.config.preset);
    let _ = writeln!(out, "attempts:     {} of {}", job.attempt_count, job.max_attempts);
    match &job.last_error {
        Some(error) => {
            let _ = writeln!(out, "error kind:   {}", error.kind);
            let _ = writeln!(out, "error:        {}", error.message);
        }
        None => {
            let _ = writeln!(out, "error:        (none recorded)");
        }
    }
    if !job.engines.is_empty() {
        let _ = writeln!(out, "engines:");
        for engine in &job.engines {
            let _ = match &engine.fallback_from {
                Some(from) => writeln!(
                    out,
                    "  {}: {} (fallback from {})",
                    engine.capability, engine.name, from
                ),
                None => writeln!(out, "  {}: {}", engine.capability, engine.name),
            };
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "log:");
    for entry in &job.log {
        let _ = writeln!(out, "  {}  {}", entry.at.to_rfc3339(), entry.message);
    }
    out
}

/// Finalizes completed and failed jobs.
#[derive(Debug, Clone)]
pub struct ResultSink {
    store: Arc<JobStore>,
    locks: LockManager,
}

impl ResultSink {
    pub fn new(store: Arc<JobStore>, locks: LockManager) -> Self {
        Self { store, locks }
    }

    /// Dispositions the input of job `id` and moves it to its terminal state.
    ///
    /// Calling this on a job that is already terminal is a no-op.
    pub fn finalize(&self, id: &str) -> Result<JobRecord, SinkError> {
        let job = self.store.resolve(id)?;
        match job.state {
            JobState::Archived | JobState::Errored => Ok(job),
            JobState::Completed => self.archive(job),
            JobState::Failed => self.error_out(job),
            state => Err(SinkError::NotFinished { id: job.id, state }),
        }
    }

    /// [`finalize`](Self::finalize) on the blocking pool.
    pub async fn finalize_async(&self, id: &str) -> Result<JobRecord, SinkError> {
        let sink = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || sink.finalize(&id))
            .await
            .map_err(|e| SinkError::Join(e.to_string()))?
    }

    fn archive(&self, mut job: JobRecord) -> Result<JobRecord, SinkError> {
        let output_ok = fs::metadata(&job.destination_path)
            .map(|m| m.is_file())
            .unwrap_or(false);

        if !output_ok {
            warn!(
                "Job {}: output {} is missing; leaving original in place",
                job.id,
                job.destination_path.display()
            );
            job.note("output missing at finalization; original left in place");
        } else {
            match job.disposition.on_complete {
                CompletionAction::Move => {
                    let Some(completed_dir) = job.disposition.completed_dir.clone() else {
                        warn!("Job {}: no completed area configured; preserving original", job.id);
                        return self.finish(job, JobState::Archived);
                    };
                    job = self.relocate_input(job, &completed_dir)?;
                }
                CompletionAction::Delete => match fs::remove_file(&job.source_path) {
                    Ok(()) => {
                        info!("Job {}: deleted original {}", job.id, job.source_path.display());
                        job.note("original deleted");
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(SinkError::io(&job.source_path, e)),
                },
                // The marker must exist before `finish` releases the lock.
                CompletionAction::Preserve => {
                    let marker = DoneMarker {
                        job_id: job.id.clone(),
                        size: job.source_size,
                        modified: job.source_modified,
                        finished_at: Utc::now(),
                    };
                    let path = write_done_marker(&job.source_path, &marker)
                        .map_err(|e| SinkError::io(&job.source_path, e))?;
                    debug!("Job {}: marked {} done", job.id, path.display());
                }
            }
        }

        self.finish(job, JobState::Archived)
    }

    fn error_out(&self, job: JobRecord) -> Result<JobRecord, SinkError> {
        let error_dir = job.disposition.error_dir.clone();
        let mut job = self.relocate_input(job, &error_dir)?;

        let report_for = job
            .archived_input
            .clone()
            .unwrap_or_else(|| area_target(&job.source_path, None, &error_dir));
        let report = error_report_path(&report_for);
        if let Some(parent) = report.parent() {
            fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;
        }
        fs::write(&report, render_report(&job)).map_err(|e| SinkError::io(&report, e))?;
        job.note(format!("error report written to {}", report.display()));

        self.finish(job, JobState::Errored)
    }

    /// Moves the input into `area`, persisting the chosen target first.
    fn relocate_input(&self, mut job: JobRecord, area: &Path) -> Result<JobRecord, SinkError> {
        let target = match job.archived_input.clone() {
            Some(target) => target,
            None => {
                if !job.source_path.exists() {
                    warn!(
                        "Job {}: original {} no longer exists; nothing to move",
                        job.id,
                        job.source_path.display()
                    );
                    return Ok(job);
                }
                if job.source_path.starts_with(area) {
                    // Retried from the error area; it is already where it belongs.
                    job.archived_input = Some(job.source_path.clone());
                    return Ok(self.store.update(&job)?);
                }
                let target = unique_path(&area_target(
                    &job.source_path,
                    job.disposition.input_root.as_deref(),
                    area,
                ));
                job.archived_input = Some(target.clone());
                job.note(format!("moving original to {}", target.display()));
                job = self.store.update(&job)?;
                target
            }
        };

        if job.source_path.exists() && !target.exists() {
            move_file(&job.source_path, &target)?;
            info!(
                "Job {}: moved {} -> {}",
                job.id,
                job.source_path.display(),
                target.display()
            );
        }
        Ok(job)
    }

    fn finish(&self, mut job: JobRecord, terminal: JobState) -> Result<JobRecord, SinkError> {
        if let Some(token) = job.lock_token.take() {
            self.locks.release_token(&job.source_path, &token)?;
        }
        job.transition(terminal)
            .map_err(|e| SinkError::Store(StoreError::InvalidTransition(e)))?;
        Ok(self.store.update(&job)?)
    }
}
