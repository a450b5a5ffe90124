//! Lenient on-disk configuration shape and the migration into [`Config`].
//!
//! Version 1 files (or files with no `version`) used flat legacy names such as
//! `min_file_size_mb`, `retry_delay` and three separate completion booleans. Those
//! are mapped here, in one place, so nothing downstream ever sees an `Option`
//! standing in for a default.

use crate::config::{
    CapabilityRequest, CompletionAction, Config, ConfigError, EngineConfig, LockConfig,
    SchedulerConfig, StabilityConfig, StateConfig, TranscoderConfig, WatchFolderConfig,
    CURRENT_VERSION,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

const MIB: f64 = 1024.0 * 1024.0;

const DEFAULT_STABILITY_INTERVAL_MS: u64 = 3_000;
const DEFAULT_REQUIRED_SAMPLES: u32 = 2;
const DEFAULT_SCHEDULER_POLL_MS: u64 = 1_000;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 6 * 60 * 60;
const DEFAULT_STALE_AFTER_SECS: u64 = 60 * 60;
const DEFAULT_MIN_SIZE_BYTES: u64 = 1024 * 1024;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
const DEFAULT_FOLDER_POLL_MS: u64 = 5_000;
const DEFAULT_PRESET: &str = "default";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub version: Option<u32>,
    pub state: RawState,
    pub stability: RawStability,
    pub scheduler: RawScheduler,
    pub locks: RawLocks,
    pub transcoder: Option<TranscoderConfig>,
    pub engines: Vec<EngineConfig>,
    pub watch_folders: Vec<RawWatchFolder>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawState {
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawStability {
    pub interval_ms: Option<u64>,
    /// legacy (v1): whole seconds
    pub interval_secs: Option<u64>,
    pub required_samples: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawScheduler {
    pub workers: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub job_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawLocks {
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawWatchFolder {
    pub name: Option<String>,
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub preset: Option<String>,
    pub overrides: BTreeMap<String, String>,
    pub capabilities: Vec<CapabilityRequest>,
    pub file_patterns: Option<Vec<String>>,
    pub exclude_patterns: Vec<String>,
    pub min_size_bytes: Option<u64>,
    pub on_complete: Option<CompletionAction>,
    pub completed_subdir: Option<String>,
    pub error_subdir: Option<String>,
    pub recursive: Option<bool>,
    pub preserve_structure: Option<bool>,
    pub output_extension: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,

    // legacy (v1) names
    pub min_file_size_mb: Option<f64>,
    pub move_on_complete: Option<bool>,
    pub delete_on_complete: Option<bool>,
    pub preserve_originals: Option<bool>,
    pub retry_delay: Option<u64>,
}

/// Turn a parsed file of any supported version into a fully-populated [`Config`].
pub fn migrate(raw: RawConfig) -> Result<Config, ConfigError> {
    let version = raw.version.unwrap_or(1);
    if version > CURRENT_VERSION {
        return Err(ConfigError::UnsupportedVersion { found: version });
    }

    let state_dir = raw.state.state_dir.ok_or_else(|| ConfigError::MissingField {
        context: "[state]".to_string(),
        field: "state_dir",
    })?;

    let interval_ms = match (raw.stability.interval_ms, raw.stability.interval_secs) {
        (Some(ms), None) => ms,
        (None, Some(secs)) => secs.saturating_mul(1000),
        (None, None) => DEFAULT_STABILITY_INTERVAL_MS,
        (Some(_), Some(_)) => {
            return Err(ConfigError::Conflict {
                context: "[stability]".to_string(),
                detail: "interval_ms and legacy interval_secs are both set".to_string(),
            })
        }
    };

    let watch_folders = raw
        .watch_folders
        .into_iter()
        .enumerate()
        .map(|(index, folder)| migrate_folder(index, folder))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Config {
        version: CURRENT_VERSION,
        state: StateConfig { state_dir },
        stability: StabilityConfig {
            interval_ms,
            required_samples: raw
                .stability
                .required_samples
                .unwrap_or(DEFAULT_REQUIRED_SAMPLES),
        },
        scheduler: SchedulerConfig {
            workers: raw.scheduler.workers.unwrap_or(0),
            poll_interval_ms: raw
                .scheduler
                .poll_interval_ms
                .unwrap_or(DEFAULT_SCHEDULER_POLL_MS),
            job_timeout_secs: raw
                .scheduler
                .job_timeout_secs
                .unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
        },
        locks: LockConfig {
            stale_after_secs: raw.locks.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS),
        },
        transcoder: raw.transcoder.unwrap_or_default(),
        engines: raw.engines,
        watch_folders,
    })
}

fn migrate_folder(index: usize, raw: RawWatchFolder) -> Result<WatchFolderConfig, ConfigError> {
    let context = match &raw.name {
        Some(name) => format!("watch folder '{}'", name),
        None => format!("watch folder #{}", index + 1),
    };

    let input_dir = raw.input_dir.ok_or_else(|| ConfigError::MissingField {
        context: context.clone(),
        field: "input_dir",
    })?;
    let output_dir = raw.output_dir.ok_or_else(|| ConfigError::MissingField {
        context: context.clone(),
        field: "output_dir",
    })?;

    let name = raw.name.unwrap_or_else(|| {
        input_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("folder-{}", index + 1))
    });

    let min_size_bytes = match (raw.min_size_bytes, raw.min_file_size_mb) {
        (Some(bytes), None) => bytes,
        (None, Some(mb)) if mb >= 0.0 => (mb * MIB).round() as u64,
        (None, Some(mb)) => {
            return Err(ConfigError::Conflict {
                context,
                detail: format!("min_file_size_mb must not be negative (got {})", mb),
            })
        }
        (None, None) => DEFAULT_MIN_SIZE_BYTES,
        (Some(_), Some(_)) => {
            return Err(ConfigError::Conflict {
                context,
                detail: "min_size_bytes and legacy min_file_size_mb are both set".to_string(),
            })
        }
    };

    let retry_delay_secs = match (raw.retry_delay_secs, raw.retry_delay) {
        (Some(secs), None) | (None, Some(secs)) => secs,
        (None, None) => DEFAULT_RETRY_DELAY_SECS,
        (Some(_), Some(_)) => {
            return Err(ConfigError::Conflict {
                context,
                detail: "retry_delay_secs and legacy retry_delay are both set".to_string(),
            })
        }
    };

    let on_complete = resolve_completion(
        &context,
        raw.on_complete,
        raw.move_on_complete.unwrap_or(false),
        raw.delete_on_complete.unwrap_or(false),
        raw.preserve_originals.unwrap_or(false),
    )?;

    let output_extension = raw
        .output_extension
        .map(|ext| ext.trim_start_matches('.').to_string())
        .filter(|ext| !ext.is_empty());

    Ok(WatchFolderConfig {
        name,
        input_dir,
        output_dir,
        preset: raw.preset.unwrap_or_else(|| DEFAULT_PRESET.to_string()),
        overrides: raw.overrides,
        capabilities: raw.capabilities,
        file_patterns: raw.file_patterns.unwrap_or_else(|| vec!["*".to_string()]),
        exclude_patterns: raw.exclude_patterns,
        min_size_bytes,
        on_complete,
        completed_subdir: raw.completed_subdir.unwrap_or_else(|| "completed".to_string()),
        error_subdir: raw.error_subdir.unwrap_or_else(|| "error".to_string()),
        recursive: raw.recursive.unwrap_or(false),
        preserve_structure: raw.preserve_structure.unwrap_or(false),
        output_extension,
        max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        retry_delay_secs,
        poll_interval_ms: raw.poll_interval_ms.unwrap_or(DEFAULT_FOLDER_POLL_MS),
    })
}

/// The three legacy booleans are mutually exclusive; at most one may be set, and it
/// must agree with `on_complete` when both forms are present.
fn resolve_completion(
    context: &str,
    explicit: Option<CompletionAction>,
    move_on_complete: bool,
    delete_on_complete: bool,
    preserve_originals: bool,
) -> Result<CompletionAction, ConfigError> {
    let legacy: Vec<CompletionAction> = [
        (move_on_complete, CompletionAction::Move),
        (delete_on_complete, CompletionAction::Delete),
        (preserve_originals, CompletionAction::Preserve),
    ]
    .into_iter()
    .filter_map(|(set, action)| set.then_some(action))
    .collect();

    if legacy.len() > 1 {
        return Err(ConfigError::Conflict {
            context: context.to_string(),
            detail: "move_on_complete, delete_on_complete and preserve_originals are mutually exclusive"
                .to_string(),
        });
    }

    match (explicit, legacy.first().copied()) {
        (Some(explicit), Some(legacy)) if explicit != legacy => Err(ConfigError::Conflict {
            context: context.to_string(),
            detail: format!(
                "on_complete = \"{}\" contradicts the legacy '{}' flag",
                explicit, legacy
            ),
        }),
        (Some(action), _) | (None, Some(action)) => Ok(action),
        (None, None) => Ok(CompletionAction::Move),
    }
}
