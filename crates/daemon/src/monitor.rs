//! Watch-folder monitor.
//!
//! One monitor per configured folder. Each poll scans the folder; every new
//! candidate gets its own task that waits for the file to settle, takes the
//! input lock and enqueues a job. Candidates never block each other or the scan.

use crate::config::{Config, WatchFolderConfig};
use crate::job::{Disposition, JobOrigin, JobRecord, NewJob, ProcessingConfig};
use crate::lock::{LockError, LockInfo, LockManager, LockOutcome};
use crate::marker::is_done;
use crate::scan::{scan_folder, FileFilter, ScanOptions};
use crate::stability::{StabilityDetector, StabilityOutcome};
use crate::store::{JobStore, StoreError};
use chrono::{DateTime, Utc};
use glob::PatternError;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("watch folder '{folder}': invalid pattern: {source}")]
    Pattern {
        folder: String,
        #[source]
        source: PatternError,
    },

    #[error("watch folder '{folder}': cannot read {path}: {source}")]
    InputUnreadable {
        folder: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("watch folder '{folder}': output directory {path} is not writable: {source}")]
    OutputUnwritable {
        folder: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("monitor task failed: {0}")]
    Join(String),
}

impl MonitorError {
    /// Errors that stop this folder's monitor.
    pub fn is_systemic(&self) -> bool {
        match self {
            MonitorError::OutputUnwritable { .. } | MonitorError::Pattern { .. } => true,
            MonitorError::Store(e) => e.is_systemic(),
            _ => false,
        }
    }
}

/// What happened to one candidate file.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    Enqueued(JobRecord),
    /// Did not match the patterns, or settled below the minimum size.
    Filtered,
    /// Another process holds the input lock.
    AlreadyLocked(Option<LockInfo>),
    /// Removed while settling.
    Abandoned,
    /// A job for this exact file already exists, here or behind a done marker.
    Duplicate,
    Cancelled,
}

type Fingerprint = (u64, Option<DateTime<Utc>>);

/// Watches one folder and turns settled files into jobs.
#[derive(Debug)]
pub struct WatchFolderMonitor {
    folder: WatchFolderConfig,
    filter: FileFilter,
    skip_dirs: Vec<PathBuf>,
    store: Arc<JobStore>,
    locks: LockManager,
    detector: StabilityDetector,
    job_timeout_secs: u64,
    in_flight: Mutex<HashSet<PathBuf>>,
    /// Files already filtered out, skipped until they change.
    rejected: Mutex<HashMap<PathBuf, Fingerprint>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WatchFolderMonitor {
    pub fn new(
        folder: WatchFolderConfig,
        config: &Config,
        store: Arc<JobStore>,
        locks: LockManager,
    ) -> Result<Self, MonitorError> {
        let filter = FileFilter::new(&folder.file_patterns, &folder.exclude_patterns).map_err(
            |source| MonitorError::Pattern {
                folder: folder.name.clone(),
                source,
            },
        )?;
        let detector = StabilityDetector::new(
            Duration::from_millis(config.stability.interval_ms),
            config.stability.required_samples,
            folder.min_size_bytes,
        );
        Ok(Self {
            skip_dirs: vec![folder.completed_dir(), folder.error_dir(), folder.output_dir.clone()],
            filter,
            store,
            locks,
            detector,
            job_timeout_secs: config.scheduler.job_timeout_secs,
            folder,
            in_flight: Mutex::new(HashSet::new()),
            rejected: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.folder.name
    }

    /// Fails if the output directory cannot be created or written to.
    pub fn check_output_dir(&self) -> Result<(), MonitorError> {
        let dir = &self.folder.output_dir;
        let unwritable = |source| MonitorError::OutputUnwritable {
            folder: self.folder.name.clone(),
            path: dir.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(unwritable)?;
        let probe = dir.join(format!(".reelwatch-write-test-{}", std::process::id()));
        fs::write(&probe, b"").map_err(unwritable)?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    /// Where the output for `source` goes.
    pub fn destination_for(&self, source: &Path) -> PathBuf {
        let mut dest = self.folder.output_dir.clone();
        if self.folder.preserve_structure {
            if let Some(relative) = source
                .parent()
                .and_then(|parent| parent.strip_prefix(&self.folder.input_dir).ok())
            {
                dest.push(relative);
            }
        }
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = self
            .folder
            .output_extension
            .as_deref()
            .map(|e| e.trim_start_matches('.').to_string())
            .or_else(|| source.extension().map(|e| e.to_string_lossy().into_owned()));
        match ext {
            Some(ext) if !ext.is_empty() => dest.push(format!("{}.{}", stem, ext)),
            _ => dest.push(stem),
        }
        dest
    }

    /// Scans once and returns the paths that need a stability check.
    ///
    /// Returned paths are marked in flight until [`finish_candidate`](Self::finish_candidate).
    pub fn scan_once(&self) -> Result<Vec<PathBuf>, MonitorError> {
        let options = ScanOptions {
            recursive: self.folder.recursive,
            skip_dirs: &self.skip_dirs,
            filter: &self.filter,
        };
        let candidates =
            scan_folder(&self.folder.input_dir, &options).map_err(|source| {
                MonitorError::InputUnreadable {
                    folder: self.folder.name.clone(),
                    path: self.folder.input_dir.clone(),
                    source,
                }
            })?;

        let mut in_flight = guard(&self.in_flight);
        let rejected = guard(&self.rejected);
        let mut fresh = Vec::new();
        for candidate in candidates {
            if in_flight.contains(&candidate.path) {
                continue;
            }
            if rejected.get(&candidate.path) == Some(&(candidate.size_bytes, candidate.modified)) {
                continue;
            }
            if self.store.active_for_source(&candidate.path).is_some()
                || self
                    .store
                    .has_fingerprint(&candidate.path, candidate.size_bytes, candidate.modified)
                || is_done(&candidate.path, candidate.size_bytes, candidate.modified)
            {
                continue;
            }
            in_flight.insert(candidate.path.clone());
            fresh.push(candidate.path);
        }
        if !fresh.is_empty() {
            debug!("Watch folder '{}': {} new candidate(s)", self.folder.name, fresh.len());
        }
        Ok(fresh)
    }

    pub fn finish_candidate(&self, path: &Path) {
        guard(&self.in_flight).remove(path);
    }

    /// Takes one candidate from discovery to the queue.
    pub async fn process_candidate(
        &self,
        path: &Path,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CandidateOutcome, MonitorError> {
        if !self.filter.matches(path) {
            return Ok(CandidateOutcome::Filtered);
        }

        let sample = match self.detector.wait_until_stable(path, shutdown).await {
            StabilityOutcome::Stable(sample) => sample,
            StabilityOutcome::BelowMinimum(sample) => {
                info!(
                    "Skipping {}: {} bytes is below the {} byte minimum",
                    path.display(),
                    sample.size,
                    self.folder.min_size_bytes
                );
                guard(&self.rejected).insert(path.to_path_buf(), (sample.size, sample.modified));
                return Ok(CandidateOutcome::Filtered);
            }
            StabilityOutcome::Abandoned => {
                info!("{} disappeared before it settled", path.display());
                return Ok(CandidateOutcome::Abandoned);
            }
            StabilityOutcome::Cancelled => return Ok(CandidateOutcome::Cancelled),
        };

        if self.store.active_for_source(path).is_some()
            || self.store.has_fingerprint(path, sample.size, sample.modified)
            || is_done(path, sample.size, sample.modified)
        {
            return Ok(CandidateOutcome::Duplicate);
        }

        let locks = self.locks.clone();
        let owned = path.to_path_buf();
        let acquired = tokio::task::spawn_blocking(move || locks.acquire(&owned))
            .await
            .map_err(|e| MonitorError::Join(e.to_string()))?;
        let handle = match acquired? {
            LockOutcome::Acquired(handle) => handle,
            LockOutcome::AlreadyLocked(owner) => {
                info!(
                    "{} is locked by pid {}; leaving it alone",
                    path.display(),
                    owner
                        .as_ref()
                        .map(|o| o.pid.to_string())
                        .unwrap_or_else(|| "?".to_string())
                );
                return Ok(CandidateOutcome::AlreadyLocked(owner));
            }
        };
        // Another instance may have finished and released it since the check above.
        if is_done(path, sample.size, sample.modified) {
            self.locks.release(&handle)?;
            return Ok(CandidateOutcome::Duplicate);
        }

        let mut job = JobRecord::new(NewJob {
            source_path: path.to_path_buf(),
            destination_path: self.destination_for(path),
            config: ProcessingConfig {
                preset: self.folder.preset.clone(),
                overrides: self.folder.overrides.clone(),
            },
            requirements: self.folder.capabilities.clone(),
            max_attempts: self.folder.max_attempts(),
            retry_delay_secs: self.folder.retry_delay_secs,
            timeout_secs: self.job_timeout_secs,
            origin: JobOrigin::Watch {
                folder: self.folder.name.clone(),
            },
            disposition: Disposition {
                on_complete: self.folder.on_complete,
                input_root: Some(self.folder.input_dir.clone()),
                completed_dir: Some(self.folder.completed_dir()),
                error_dir: self.folder.error_dir(),
            },
        });
        job.lock_token = Some(handle.token.clone());
        job.source_size = sample.size;
        job.source_modified = sample.modified;

        let store = Arc::clone(&self.store);
        let enqueued = match tokio::task::spawn_blocking(move || store.enqueue(job)).await {
            Ok(result) => result,
            Err(e) => {
                self.locks.release(&handle)?;
                return Err(MonitorError::Join(e.to_string()));
            }
        };
        match enqueued {
            Ok(job) => Ok(CandidateOutcome::Enqueued(job)),
            Err(e) => {
                self.locks.release(&handle)?;
                match e {
                    StoreError::Duplicate { .. } => Ok(CandidateOutcome::Duplicate),
                    StoreError::SourceMissing(_) => Ok(CandidateOutcome::Abandoned),
                    e => Err(e.into()),
                }
            }
        }
    }

    /// Scans on the folder's poll interval until shutdown or a systemic error.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), MonitorError> {
        self.check_output_dir()?;
        info!(
            "Watching '{}': {} -> {}",
            self.folder.name,
            self.folder.input_dir.display(),
            self.folder.output_dir.display()
        );

        let poll = Duration::from_millis(self.folder.poll_interval_ms);
        let mut tasks: JoinSet<Result<CandidateOutcome, MonitorError>> = JoinSet::new();
        let mut next_scan = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_scan {
                let monitor = Arc::clone(&self);
                let scanned = tokio::task::spawn_blocking(move || monitor.scan_once())
                    .await
                    .map_err(|e| MonitorError::Join(e.to_string()))?;
                match scanned {
                    Ok(paths) => {
                        for path in paths {
                            let monitor = Arc::clone(&self);
                            let mut rx = shutdown.clone();
                            tasks.spawn(async move {
                                let outcome = monitor.process_candidate(&path, &mut rx).await;
                                monitor.finish_candidate(&path);
                                outcome
                            });
                        }
                    }
                    Err(e) => warn!("{}", e),
                }
                next_scan = Instant::now() + poll;
            }

            tokio::select! {
                _ = sleep_until(next_scan) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(Ok(outcome)) => debug!("Watch folder '{}': {:?}", self.folder.name, outcome),
                        Ok(Err(e)) if e.is_systemic() => {
                            error!("Watch folder '{}' stopping: {}", self.folder.name, e);
                            return Err(e);
                        }
                        Ok(Err(e)) => warn!("Watch folder '{}': {}", self.folder.name, e),
                        Err(e) => error!("Watch folder '{}': candidate task failed: {}", self.folder.name, e),
                    }
                }
            }
        }

        tasks.shutdown().await;
        info!("Stopped watching '{}'", self.folder.name);
        Ok(())
    }
}
