//! Scheduler workers.
//!
//! A worker claims the oldest ready job from the store, resolves its engines,
//! runs the transcoder against a partial output path with a hard timeout and
//! turns the result into the next state. Several workers may share one store;
//! `JobStore::next_ready` hands each job to exactly one of them.

use crate::engine::EngineSelector;
use crate::job::{ErrorKind, JobRecord, JobState};
use crate::retry::{decide, RetryDecision};
use crate::scan::partial_output_path;
use crate::sink::{ResultSink, SinkError};
use crate::store::{JobStore, StoreError};
use crate::transcode::{classify_failure, ExitStatusKind, TranscodeRequest, Transcoder};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tokio::time::sleep;

/// Errors that stop a worker.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("result sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("job store task failed: {0}")]
    Join(String),
}

impl SchedulerError {
    /// Whether the worker must stop rather than move on to the next job.
    pub fn is_systemic(&self) -> bool {
        match self {
            SchedulerError::Store(e) | SchedulerError::Sink(SinkError::Store(e)) => e.is_systemic(),
            SchedulerError::Sink(_) | SchedulerError::Join(_) => false,
        }
    }
}

/// Cancellation switches of running jobs, keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<watch::Sender<bool>>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<watch::Sender<bool>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(&self, job_id: &str) -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        self.map().insert(job_id.to_string(), Arc::clone(&tx));
        (tx, rx)
    }

    pub(crate) fn remove(&self, job_id: &str) {
        self.map().remove(job_id);
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.map().contains_key(job_id)
    }

    /// Signals the worker running `job_id`. Returns false if no worker is running it.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.map().get(job_id) {
            Some(tx) => {
                let _ = tx.send(true);
                true
            }
            None => false,
        }
    }
}

/// Everything a worker needs, shared between workers.
pub struct WorkerContext {
    pub store: Arc<JobStore>,
    pub selector: EngineSelector,
    pub transcoder: Arc<dyn Transcoder>,
    pub sink: ResultSink,
    pub cancels: CancelRegistry,
}

/// How one attempt ended.
enum AttemptOutcome {
    Succeeded,
    Failed(ErrorKind, String),
    /// Shutdown killed the tool; the job stays `Running` for recovery.
    Interrupted,
}

pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        id: usize,
        ctx: Arc<WorkerContext>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            ctx,
            poll_interval,
            shutdown,
        }
    }

    /// Polls the store until shutdown. Returns early only on a systemic error.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        info!("Worker {} started", self.id);
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once(Utc::now()).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) if e.is_systemic() => {
                    error!("Worker {} stopping: {}", self.id, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Worker {}: {}", self.id, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("Worker {} stopped", self.id);
        Ok(())
    }

    /// Claims and processes at most one job ready at `now`.
    ///
    /// A retry is scheduled `retry_delay` after the attempt fails, never earlier
    /// than `now + retry_delay`. Returns the job's record after this step, or
    /// `None` if nothing was ready.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, SchedulerError> {
        let store = Arc::clone(&self.ctx.store);
        let claimed = tokio::task::spawn_blocking(move || store.next_ready(now))
            .await
            .map_err(|e| SchedulerError::Join(e.to_string()))?;
        let Some(mut job) = claimed? else {
            return Ok(None);
        };
        debug!("Worker {} claimed job {}", self.id, job.id);

        if !job.source_path.exists() {
            job.record_error(ErrorKind::InputMissing, "source file disappeared before processing");
            return self.give_up(job).await.map(Some);
        }

        if job.attempt_count >= job.max_attempts {
            job.note("attempt budget already spent");
            return self.give_up(job).await.map(Some);
        }

        let selections = match self.ctx.selector.resolve(&job.requirements).await {
            Ok(selections) => selections,
            Err(e) => {
                warn!("Job {}: {}", job.id, e);
                job.record_error(ErrorKind::Configuration, e.to_string());
                return self.give_up(job).await.map(Some);
            }
        };

        job.engines = selections.iter().map(|s| s.to_selected()).collect();
        for selection in selections.iter().filter(|s| s.is_fallback()) {
            job.note(format!(
                "engine fallback for {}: {} unavailable, using {}",
                selection.engine.capability,
                selection.fallback_from.as_deref().unwrap_or("?"),
                selection.engine.name
            ));
        }
        let attempt = job
            .begin_attempt()
            .map_err(|e| SchedulerError::Store(e.into()))?;
        let mut job = self.save(job).await?;
        info!(
            "Job {}: attempt {} of {} on {}",
            job.id,
            attempt,
            job.max_attempts,
            job.source_path.display()
        );

        let outcome = self.attempt(&mut job).await;

        match outcome {
            AttemptOutcome::Succeeded => {
                job.transition(JobState::Completed)
                    .map_err(|e| SchedulerError::Store(e.into()))?;
                let job = self.save(job).await?;
                self.finalize(job).await.map(Some)
            }
            AttemptOutcome::Failed(kind, message) => {
                warn!("Job {}: attempt {} failed: {}", job.id, attempt, message);
                job.record_error(kind, message);
                // The delay runs from the failure; `now` only decided what was ready.
                let failed_at = Utc::now().max(now);
                match decide(&job, failed_at) {
                    RetryDecision::Retry { at, .. } => {
                        job.schedule_retry(at)
                            .map_err(|e| SchedulerError::Store(e.into()))?;
                        info!("Job {}: retry at {}", job.id, at.to_rfc3339());
                        self.save(job).await.map(Some)
                    }
                    RetryDecision::GiveUp(reason) => {
                        job.note(format!("giving up: {}", reason));
                        self.give_up(job).await.map(Some)
                    }
                }
            }
            AttemptOutcome::Interrupted => {
                info!("Job {}: interrupted by shutdown; left for recovery", job.id);
                Ok(Some(job))
            }
        }
    }

    /// Runs the tool once and renames its output into place on success.
    async fn attempt(&self, job: &mut JobRecord) -> AttemptOutcome {
        let partial = partial_output_path(&job.destination_path);
        if let Some(parent) = job.destination_path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return AttemptOutcome::Failed(
                    ErrorKind::FsContention,
                    format!("cannot create {}: {}", parent.display(), e),
                );
            }
        }
        remove_if_exists(&partial).await;

        let request = TranscodeRequest {
            job_id: job.id.clone(),
            input: job.source_path.clone(),
            output: partial.clone(),
            config: job.config.clone(),
            engines: job.engines.clone(),
        };

        let (cancel_tx, cancel_rx) = self.ctx.cancels.register(&job.id);
        let mut shutdown = self.shutdown.clone();
        let mut interrupted = *shutdown.borrow();
        if interrupted {
            let _ = cancel_tx.send(true);
        }

        let execution = self.ctx.transcoder.execute(&request, job.timeout(), cancel_rx);
        tokio::pin!(execution);
        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                changed = shutdown.changed(), if !interrupted => {
                    if changed.is_err() || *shutdown.borrow() {
                        interrupted = true;
                        let _ = cancel_tx.send(true);
                    }
                }
            }
        };
        self.ctx.cancels.remove(&job.id);

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                remove_if_exists(&partial).await;
                return AttemptOutcome::Failed(e.kind(), e.to_string());
            }
        };
        job.progress = report.last_progress;

        if interrupted && report.status == ExitStatusKind::Cancelled {
            remove_if_exists(&partial).await;
            return AttemptOutcome::Interrupted;
        }

        if let Some((kind, message)) = classify_failure(&report) {
            remove_if_exists(&partial).await;
            return AttemptOutcome::Failed(kind, message);
        }

        match fs::metadata(&partial).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => {
                remove_if_exists(&partial).await;
                return AttemptOutcome::Failed(
                    ErrorKind::OutputInvalid,
                    "transcoder reported success but the output is empty".to_string(),
                );
            }
            Err(e) => {
                return AttemptOutcome::Failed(
                    ErrorKind::OutputInvalid,
                    format!("transcoder reported success but wrote no output: {}", e),
                );
            }
        }

        if let Err(e) = fs::rename(&partial, &job.destination_path).await {
            remove_if_exists(&partial).await;
            return AttemptOutcome::Failed(
                ErrorKind::FsContention,
                format!("cannot move output into place: {}", e),
            );
        }
        job.progress = Some(100.0);
        AttemptOutcome::Succeeded
    }

    /// Marks the claimed job `Failed` and hands it to the sink.
    async fn give_up(&self, mut job: JobRecord) -> Result<JobRecord, SchedulerError> {
        job.transition(JobState::Failed)
            .map_err(|e| SchedulerError::Store(e.into()))?;
        let job = self.save(job).await?;
        self.finalize(job).await
    }

    /// Persists `job` on the blocking pool.
    async fn save(&self, job: JobRecord) -> Result<JobRecord, SchedulerError> {
        let store = Arc::clone(&self.ctx.store);
        let saved = tokio::task::spawn_blocking(move || store.update(&job))
            .await
            .map_err(|e| SchedulerError::Join(e.to_string()))?;
        Ok(saved?)
    }

    /// Runs the sink. A failed disposition leaves the job for recovery to retry.
    async fn finalize(&self, job: JobRecord) -> Result<JobRecord, SchedulerError> {
        match self.ctx.sink.finalize_async(&job.id).await {
            Ok(done) => Ok(done),
            Err(SinkError::Store(e)) if e.is_systemic() => Err(SchedulerError::Store(e)),
            Err(e) => {
                error!("Job {}: result sink failed: {}", job.id, e);
                Ok(self.ctx.store.get(&job.id).unwrap_or(job))
            }
        }
    }
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
