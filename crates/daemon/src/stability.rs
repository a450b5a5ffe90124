//! Stability checking module for verifying files are no longer being written.
//!
//! A file that shows up in a watch folder may still be copying in. The detector
//! samples `(size, mtime)` at a fixed interval and only calls the file stable
//! after `required_samples` consecutive samples matched their predecessor.
//! A file that keeps changing is sampled until it disappears or the monitor
//! shuts down.

use chrono::{DateTime, Utc};
use log::debug;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// One observation of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSample {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl FileSample {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

/// Where a file is in the stability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settling {
    /// Not stable yet; `unchanged` consecutive samples matched so far.
    Pending { unchanged: u32 },
    Stable,
}

/// Compare two samples. Any difference in size or mtime counts as a change.
#[inline]
pub fn compare_samples(previous: &FileSample, current: &FileSample) -> bool {
    previous == current
}

/// Pure sample bookkeeping, separated from the timer for property testing.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    required: u32,
    last: Option<FileSample>,
    unchanged: u32,
}

impl StabilityTracker {
    pub fn new(required_samples: u32) -> Self {
        Self {
            required: required_samples.max(1),
            last: None,
            unchanged: 0,
        }
    }

    pub fn observe(&mut self, sample: FileSample) -> Settling {
        match &self.last {
            Some(previous) if compare_samples(previous, &sample) => self.unchanged += 1,
            _ => self.unchanged = 0,
        }
        self.last = Some(sample);

        if self.unchanged >= self.required {
            Settling::Stable
        } else {
            Settling::Pending {
                unchanged: self.unchanged,
            }
        }
    }

    pub fn last(&self) -> Option<FileSample> {
        self.last
    }
}

/// How a stability check ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityOutcome {
    Stable(FileSample),
    /// Stable, but smaller than the configured minimum.
    BelowMinimum(FileSample),
    /// The file disappeared while being sampled.
    Abandoned,
    /// Shutdown was requested.
    Cancelled,
}

/// Samples one file until it settles.
#[derive(Debug, Clone)]
pub struct StabilityDetector {
    interval: Duration,
    required_samples: u32,
    min_size_bytes: u64,
}

impl StabilityDetector {
    pub fn new(interval: Duration, required_samples: u32, min_size_bytes: u64) -> Self {
        Self {
            interval,
            required_samples,
            min_size_bytes,
        }
    }

    /// Waits for `path` to stop changing.
    ///
    /// Never gives up on a growing file; only removal or shutdown end the wait early.
    pub async fn wait_until_stable(
        &self,
        path: &Path,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StabilityOutcome {
        let mut tracker = StabilityTracker::new(self.required_samples);

        loop {
            if *shutdown.borrow() {
                return StabilityOutcome::Cancelled;
            }

            match sample(path).await {
                Ok(current) => {
                    let state = tracker.observe(current);
                    debug!(
                        "Stability sample {}: {} bytes ({:?})",
                        path.display(),
                        current.size,
                        state
                    );
                    if state == Settling::Stable {
                        return if current.size >= self.min_size_bytes {
                            StabilityOutcome::Stable(current)
                        } else {
                            StabilityOutcome::BelowMinimum(current)
                        };
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} disappeared while settling", path.display());
                    return StabilityOutcome::Abandoned;
                }
                Err(e) => {
                    debug!("Cannot sample {}: {}", path.display(), e);
                    tracker = StabilityTracker::new(self.required_samples);
                }
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return StabilityOutcome::Cancelled;
                    }
                }
            }
        }
    }
}

async fn sample(path: &Path) -> Result<FileSample, io::Error> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
    }
    Ok(FileSample::from_metadata(&metadata))
}
