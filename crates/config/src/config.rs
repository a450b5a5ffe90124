//! Core configuration structures and loading logic
//!
//! A configuration file goes through three steps before the daemon sees it:
//! parse into the lenient [`RawConfig`](crate::migrate::RawConfig), migrate legacy
//! fields into the fully-populated [`Config`], then validate once.

use crate::migrate::{migrate, RawConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Schema version written by this release.
pub const CURRENT_VERSION: u32 = 2;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file declares a schema version newer than this build understands
    #[error(
        "Unsupported config version {found} (this build understands up to {max})",
        max = CURRENT_VERSION
    )]
    UnsupportedVersion { found: u32 },

    /// A required field is missing after migration
    #[error("Missing required field `{field}` in {context}")]
    MissingField { context: String, field: &'static str },

    /// Fields that may not be combined were set together
    #[error("Conflicting settings in {context}: {detail}")]
    Conflict { context: String, detail: String },

    /// Validation found one or more problems
    #[error("Invalid configuration:\n  - {}", .issues.join("\n  - "))]
    Invalid { issues: Vec<String> },
}

/// A processing capability that one or more engines can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Upscale,
    Deinterlace,
    AudioEnhance,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::Upscale,
        Capability::Deinterlace,
        Capability::AudioEnhance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Upscale => "upscale",
            Capability::Deinterlace => "deinterlace",
            Capability::AudioEnhance => "audio_enhance",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "upscale" => Ok(Capability::Upscale),
            "deinterlace" => Ok(Capability::Deinterlace),
            "audio_enhance" => Ok(Capability::AudioEnhance),
            other => Err(format!("unknown capability '{}'", other)),
        }
    }
}

/// A capability a job needs, with an optional preferred engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub capability: Capability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_engine: Option<String>,
}

impl FromStr for CapabilityRequest {
    type Err = String;

    /// Parses `upscale` or `upscale=realesrgan`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cap, engine) = match s.split_once('=') {
            Some((cap, engine)) => (cap, Some(engine.trim().to_string())),
            None => (s, None),
        };
        Ok(Self {
            capability: cap.parse()?,
            preferred_engine: engine.filter(|e| !e.is_empty()),
        })
    }
}

/// What happens to an original input once its job completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAction {
    /// Move the original into the completed subfolder
    Move,
    /// Delete the original
    Delete,
    /// Leave the original where it is
    Preserve,
}

impl fmt::Display for CompletionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionAction::Move => write!(f, "move"),
            CompletionAction::Delete => write!(f, "delete"),
            CompletionAction::Preserve => write!(f, "preserve"),
        }
    }
}

/// Where the job store and command drop box live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    pub state_dir: PathBuf,
}

/// File stability sampling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StabilityConfig {
    /// Delay between samples in milliseconds (default 3000)
    pub interval_ms: u64,
    /// Consecutive unchanged samples required before a file counts as stable (default 2)
    pub required_samples: u32,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Number of workers (0 = derive from core count)
    pub workers: u32,
    /// How long an idle worker sleeps before polling the store again
    pub poll_interval_ms: u64,
    /// Hard wall-clock limit for a single external tool invocation
    pub job_timeout_secs: u64,
}

/// Input lock settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockConfig {
    /// Age after which an unreadable lock file may be reclaimed
    pub stale_after_secs: u64,
}

/// The external transcoding tool and its argument template.
///
/// Every argument is passed to the process as-is after placeholder substitution;
/// no shell is ever involved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscoderConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "reelwatch-transcode".to_string(),
            args: vec![
                "--input".to_string(),
                "{input}".to_string(),
                "--output".to_string(),
                "{output}".to_string(),
                "--preset".to_string(),
                "{preset}".to_string(),
                "--engines".to_string(),
                "{engines}".to_string(),
                "--set".to_string(),
                "{overrides}".to_string(),
            ],
        }
    }
}

/// An engine definition supplied through `[[engines]]`.
///
/// An entry whose `capability` and `name` match a built-in engine replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub capability: Capability,
    pub name: String,
    pub priority: u32,
    /// Executable that must be on PATH (or an absolute path)
    #[serde(default)]
    pub binary: Option<String>,
    /// Argument for a cheap self-check, e.g. `--version`
    #[serde(default)]
    pub version_arg: Option<String>,
    /// Runtime files (models, scripts) that must exist
    #[serde(default)]
    pub required_files: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// One watched input directory and everything needed to turn its files into jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchFolderConfig {
    pub name: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub preset: String,
    pub overrides: BTreeMap<String, String>,
    pub capabilities: Vec<CapabilityRequest>,
    pub file_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub min_size_bytes: u64,
    pub on_complete: CompletionAction,
    pub completed_subdir: String,
    pub error_subdir: String,
    pub recursive: bool,
    pub preserve_structure: bool,
    pub output_extension: Option<String>,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub poll_interval_ms: u64,
}

impl WatchFolderConfig {
    /// Total attempts a job from this folder may make (first try plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.input_dir.join(&self.completed_subdir)
    }

    pub fn error_dir(&self) -> PathBuf {
        self.input_dir.join(&self.error_subdir)
    }

    fn validate_into(&self, issues: &mut Vec<String>) {
        let ctx = format!("watch folder '{}'", self.name);
        if !self.input_dir.is_absolute() {
            issues.push(format!("{}: input_dir must be absolute", ctx));
        }
        if !self.output_dir.is_absolute() {
            issues.push(format!("{}: output_dir must be absolute", ctx));
        }
        if self.input_dir == self.output_dir {
            issues.push(format!("{}: input_dir and output_dir must differ", ctx));
        }
        if self.recursive && self.output_dir.starts_with(&self.input_dir) {
            issues.push(format!(
                "{}: output_dir may not live inside a recursively watched input_dir",
                ctx
            ));
        }
        if self.file_patterns.is_empty() {
            issues.push(format!("{}: file_patterns must not be empty", ctx));
        }
        for pattern in self.file_patterns.iter().chain(&self.exclude_patterns) {
            if let Err(e) = glob::Pattern::new(pattern) {
                issues.push(format!("{}: invalid glob '{}': {}", ctx, pattern, e));
            }
        }
        for (field, value) in [
            ("completed_subdir", &self.completed_subdir),
            ("error_subdir", &self.error_subdir),
        ] {
            if value.is_empty() || value.contains('/') || value.contains('\\') || value == ".." {
                issues.push(format!("{}: {} must be a plain directory name", ctx, field));
            }
        }
        if self.completed_subdir == self.error_subdir {
            issues.push(format!("{}: completed_subdir and error_subdir must differ", ctx));
        }
        if self.poll_interval_ms == 0 {
            issues.push(format!("{}: poll_interval_ms must be > 0", ctx));
        }
        let mut seen = HashSet::new();
        for req in &self.capabilities {
            if !seen.insert(req.capability) {
                issues.push(format!(
                    "{}: capability '{}' is listed more than once",
                    ctx, req.capability
                ));
            }
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: u32,
    pub state: StateConfig,
    pub stability: StabilityConfig,
    pub scheduler: SchedulerConfig,
    pub locks: LockConfig,
    pub transcoder: TranscoderConfig,
    pub engines: Vec<EngineConfig>,
    pub watch_folders: Vec<WatchFolderConfig>,
}

impl Config {
    /// Load configuration from a TOML file without env overrides or validation
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse and migrate configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        migrate(raw)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - REELWATCH_STATE_DIR -> state.state_dir
    /// - REELWATCH_WORKERS -> scheduler.workers
    /// - REELWATCH_JOB_TIMEOUT_SECS -> scheduler.job_timeout_secs
    /// - REELWATCH_STABILITY_INTERVAL_MS -> stability.interval_ms
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REELWATCH_STATE_DIR") {
            if !val.trim().is_empty() {
                self.state.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("REELWATCH_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.scheduler.workers = workers;
            }
        }

        if let Ok(val) = env::var("REELWATCH_JOB_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.scheduler.job_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("REELWATCH_STABILITY_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.stability.interval_ms = ms;
            }
        }
    }

    /// Check the whole configuration once, reporting every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.stability.required_samples == 0 {
            issues.push("stability.required_samples must be >= 1".to_string());
        }
        if self.stability.interval_ms == 0 {
            issues.push("stability.interval_ms must be > 0".to_string());
        }
        if self.scheduler.poll_interval_ms == 0 {
            issues.push("scheduler.poll_interval_ms must be > 0".to_string());
        }
        if self.scheduler.job_timeout_secs == 0 {
            issues.push("scheduler.job_timeout_secs must be > 0".to_string());
        }
        if self.transcoder.program.trim().is_empty() {
            issues.push("transcoder.program must not be empty".to_string());
        }

        let mut names = HashSet::new();
        for engine in &self.engines {
            if !names.insert((engine.capability, engine.name.as_str())) {
                issues.push(format!(
                    "engine '{}' for '{}' is defined more than once",
                    engine.name, engine.capability
                ));
            }
        }

        let mut folder_names = HashSet::new();
        let mut input_dirs = HashSet::new();
        for folder in &self.watch_folders {
            if !folder_names.insert(folder.name.as_str()) {
                issues.push(format!("watch folder name '{}' is not unique", folder.name));
            }
            if !input_dirs.insert(folder.input_dir.as_path()) {
                issues.push(format!(
                    "input_dir {} is watched by more than one folder",
                    folder.input_dir.display()
                ));
            }
            folder.validate_into(&mut issues);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { issues })
        }
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn watch_folder(&self, name: &str) -> Option<&WatchFolderConfig> {
        self.watch_folders.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("REELWATCH_STATE_DIR");
        env::remove_var("REELWATCH_WORKERS");
        env::remove_var("REELWATCH_JOB_TIMEOUT_SECS");
        env::remove_var("REELWATCH_STABILITY_INTERVAL_MS");
    }

    const BASIC: &str = r#"
version = 2

[state]
state_dir = "/var/lib/reelwatch"

[[watch_folders]]
name = "anime"
input_dir = "/srv/in/anime"
output_dir = "/srv/out/anime"
preset = "anime-2x"
file_patterns = ["*.mkv", "*.mp4"]
exclude_patterns = ["*.sample.*"]
min_size_bytes = 1048576
on_complete = "move"
max_retries = 2
retry_delay_secs = 5

[[watch_folders.capabilities]]
capability = "upscale"
preferred_engine = "realesrgan"
"#;

    #[test]
    fn test_basic_config_parses_and_validates() {
        let config = Config::parse_toml(BASIC).expect("valid config");
        config.validate().expect("should validate");

        assert_eq!(config.version, CURRENT_VERSION);
        assert_eq!(config.state.state_dir, PathBuf::from("/var/lib/reelwatch"));
        assert_eq!(config.stability.interval_ms, 3000);
        assert_eq!(config.stability.required_samples, 2);

        let folder = &config.watch_folders[0];
        assert_eq!(folder.name, "anime");
        assert_eq!(folder.max_attempts(), 3);
        assert_eq!(folder.on_complete, CompletionAction::Move);
        assert_eq!(folder.completed_dir(), PathBuf::from("/srv/in/anime/completed"));
        assert_eq!(folder.error_dir(), PathBuf::from("/srv/in/anime/error"));
        assert_eq!(
            folder.capabilities,
            vec![CapabilityRequest {
                capability: Capability::Upscale,
                preferred_engine: Some("realesrgan".to_string()),
            }]
        );
    }

    #[test]
    fn test_validation_collects_every_issue() {
        let toml_str = r#"
version = 2
[state]
state_dir = "/tmp/state"

[[watch_folders]]
name = "a"
input_dir = "relative/in"
output_dir = "relative/in"
file_patterns = ["[unclosed"]

[[watch_folders]]
name = "a"
input_dir = "/abs/in"
output_dir = "/abs/out"
"#;
        let config = Config::parse_toml(toml_str).expect("parses");
        let err = config.validate().expect_err("should be invalid");
        match err {
            ConfigError::Invalid { issues } => {
                assert!(issues.iter().any(|i| i.contains("must be absolute")));
                assert!(issues.iter().any(|i| i.contains("must differ")));
                assert!(issues.iter().any(|i| i.contains("invalid glob")));
                assert!(issues.iter().any(|i| i.contains("not unique")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_capability_request_parsing() {
        let plain: CapabilityRequest = "deinterlace".parse().unwrap();
        assert_eq!(plain.capability, Capability::Deinterlace);
        assert_eq!(plain.preferred_engine, None);

        let preferred: CapabilityRequest = "audio-enhance=ffmpeg-afftdn".parse().unwrap();
        assert_eq!(preferred.capability, Capability::AudioEnhance);
        assert_eq!(preferred.preferred_engine.as_deref(), Some("ffmpeg-afftdn"));

        assert!("sharpen".parse::<CapabilityRequest>().is_err());
    }

    #[test]
    fn test_duplicate_capability_rejected() {
        let toml_str = r#"
[state]
state_dir = "/tmp/state"

[[watch_folders]]
name = "dup"
input_dir = "/in"
output_dir = "/out"
capabilities = [{ capability = "upscale" }, { capability = "upscale", preferred_engine = "video2x" }]
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_env_overrides_workers(initial in 0u32..8, override_workers in 0u32..64) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[state]\nstate_dir = \"/tmp/s\"\n[scheduler]\nworkers = {}\n",
                initial
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("REELWATCH_WORKERS", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.scheduler.workers, override_workers);
        }

        #[test]
        fn prop_env_overrides_stability_interval(override_ms in 1u64..100_000) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml("[state]\nstate_dir = \"/tmp/s\"\n").expect("Valid TOML");
            env::set_var("REELWATCH_STABILITY_INTERVAL_MS", override_ms.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.stability.interval_ms, override_ms);
        }
    }

    #[test]
    fn test_invalid_env_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config =
            Config::parse_toml("[state]\nstate_dir = \"/tmp/s\"\n[scheduler]\njob_timeout_secs = 60\n")
                .unwrap();
        env::set_var("REELWATCH_JOB_TIMEOUT_SECS", "forever");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.scheduler.job_timeout_secs, 60);
    }
}
