//! Orchestrator startup and main loop.
//!
//! Wires the store, locks, engine probe, transcoder and result sink into one
//! context, recovers whatever a previous process left behind, then runs one
//! monitor per watch folder, the scheduler workers and the command processor
//! until shutdown.

use crate::commands::{ApiDefaults, CommandError, CommandProcessor};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::engine::probe::{env_search_path, find_executable};
use crate::engine::{registry, unknown_preferred_engines, EngineProbe, EngineSelector};
use crate::job::{ErrorKind, JobState};
use crate::lock::{lock_path_for, read_lock, LockError, LockHandle, LockManager, LockOutcome};
use crate::monitor::{MonitorError, WatchFolderMonitor};
use crate::retry::{decide, RetryDecision};
use crate::scan::{partial_output_path, FileFilter};
use crate::scheduler::{CancelRegistry, SchedulerError, Worker, WorkerContext};
use crate::sink::{ResultSink, SinkError};
use crate::store::{JobFilter, JobStore, StoreError};
use crate::transcode::{CommandTranscoder, Transcoder};
use chrono::Utc;
use log::{error, info, warn};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;

/// Base name of the single-instance guard inside the state directory.
const DAEMON_LOCK_NAME: &str = "daemon";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("result sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("command error: {0}")]
    Commands(#[from] CommandError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("another reelwatch daemon (pid {}) is using {}", .pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()), .state_dir.display())]
    AlreadyRunning {
        state_dir: PathBuf,
        pid: Option<u32>,
    },

    #[error("configuration check failed:\n  {}", .issues.join("\n  "))]
    Check { issues: Vec<String> },

    #[error("{} task(s) stopped on errors: {}", .0.len(), .0.join("; "))]
    TasksFailed(Vec<String>),
}

/// Path of the single-instance lock file for `state_dir`.
pub fn daemon_lock_path(state_dir: &Path) -> PathBuf {
    lock_path_for(&state_dir.join(DAEMON_LOCK_NAME))
}

/// Pid of the daemon currently holding `state_dir`, if its lock file is readable.
pub fn running_daemon_pid(state_dir: &Path) -> Option<u32> {
    read_lock(&daemon_lock_path(state_dir))
        .ok()
        .flatten()
        .map(|info| info.pid)
}

/// What startup recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `Locked` jobs put back in the queue.
    pub requeued: usize,
    /// Interrupted `Running` jobs scheduled to run again.
    pub retrying: usize,
    /// Interrupted `Running` jobs that had no attempts left.
    pub failed: usize,
    /// `Completed`/`Failed` jobs handed to the result sink again.
    pub finalized: usize,
    pub locks_adopted: usize,
    /// Locks now held by another live process.
    pub locks_contested: usize,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requeued, {} retrying, {} failed, {} finalized, {} locks adopted, {} contested",
            self.requeued,
            self.retrying,
            self.failed,
            self.finalized,
            self.locks_adopted,
            self.locks_contested
        )
    }
}

/// Result of a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub notes: Vec<String>,
    pub issues: Vec<String>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validates `config` and the directories it names without starting anything.
pub fn check(config: &Config) -> CheckReport {
    let mut report = CheckReport::default();

    match config.validate() {
        Ok(()) => {}
        Err(ConfigError::Invalid { issues }) => report.issues.extend(issues),
        Err(e) => report.issues.push(e.to_string()),
    }
    report.issues.extend(unknown_preferred_engines(config));

    let state_dir = &config.state.state_dir;
    check_writable_dir(state_dir, "state_dir", &mut report);

    match find_executable(&config.transcoder.program, &env_search_path()) {
        Some(path) => report
            .notes
            .push(format!("transcoder: {}", path.display())),
        None => report.issues.push(format!(
            "transcoder program '{}' not found",
            config.transcoder.program
        )),
    }

    if config.watch_folders.is_empty() {
        report.notes.push("no watch folders configured".to_string());
    }
    for folder in &config.watch_folders {
        let ctx = format!("watch folder '{}'", folder.name);
        if let Err(e) = FileFilter::new(&folder.file_patterns, &folder.exclude_patterns) {
            report.issues.push(format!("{}: invalid pattern: {}", ctx, e));
        }
        match fs::read_dir(&folder.input_dir) {
            Ok(_) => report.notes.push(format!(
                "{}: watching {} ({} -> {})",
                ctx,
                folder.input_dir.display(),
                folder.file_patterns.join(", "),
                folder.output_dir.display()
            )),
            Err(e) => report.issues.push(format!(
                "{}: input_dir {} is not readable: {}",
                ctx,
                folder.input_dir.display(),
                e
            )),
        }
        check_writable_dir(&folder.output_dir, &format!("{}: output_dir", ctx), &mut report);
    }

    let plan = derive_plan(&config.scheduler);
    report.notes.push(format!(
        "{} worker(s) on {} core(s)",
        plan.workers, plan.total_cores
    ));
    report
}

/// Missing directories are fine if they can be created; existing ones must be writable.
fn check_writable_dir(dir: &Path, what: &str, report: &mut CheckReport) {
    if !dir.exists() {
        match dir.ancestors().skip(1).find(|a| a.exists()) {
            Some(ancestor) if can_write_in(ancestor) => report.notes.push(format!(
                "{} {} will be created",
                what,
                dir.display()
            )),
            _ => report.issues.push(format!(
                "{} {} does not exist and cannot be created",
                what,
                dir.display()
            )),
        }
        return;
    }
    if !dir.is_dir() {
        report
            .issues
            .push(format!("{} {} is not a directory", what, dir.display()));
    } else if !can_write_in(dir) {
        report
            .issues
            .push(format!("{} {} is not writable", what, dir.display()));
    }
}

fn can_write_in(dir: &Path) -> bool {
    let probe = dir.join(format!(".reelwatch-check-{}", std::process::id()));
    match fs::write(&probe, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Task exit as seen by the main loop.
enum TaskExit {
    Monitor(String, Result<(), MonitorError>),
    Worker(usize, Result<(), SchedulerError>),
    Commands(Result<(), CommandError>),
}

/// The running daemon: one per state directory.
pub struct Orchestrator {
    config: Config,
    plan: ConcurrencyPlan,
    store: Arc<JobStore>,
    locks: LockManager,
    probe: Arc<EngineProbe>,
    ctx: Arc<WorkerContext>,
    commands: CommandProcessor,
    daemon_lock: LockHandle,
}

impl Orchestrator {
    /// Opens the state directory with the configured transcoder and engine registry.
    pub fn new(config: Config) -> Result<Self, OrchestratorError> {
        let transcoder: Arc<dyn Transcoder> = Arc::new(CommandTranscoder::new(&config.transcoder));
        let probe = Arc::new(EngineProbe::new(registry(&config.engines)));
        Self::with_parts(config, transcoder, probe)
    }

    /// Like [`new`](Self::new) with an explicit transcoder and probe.
    pub fn with_parts(
        config: Config,
        transcoder: Arc<dyn Transcoder>,
        probe: Arc<EngineProbe>,
    ) -> Result<Self, OrchestratorError> {
        let issues = unknown_preferred_engines(&config);
        if !issues.is_empty() {
            return Err(OrchestratorError::Check { issues });
        }

        let state_dir = config.state.state_dir.clone();
        fs::create_dir_all(&state_dir).map_err(|source| OrchestratorError::Io {
            path: state_dir.clone(),
            source,
        })?;

        let locks = LockManager::new(Duration::from_secs(config.locks.stale_after_secs));
        let daemon_lock = match locks.acquire(&state_dir.join(DAEMON_LOCK_NAME))? {
            LockOutcome::Acquired(handle) => handle,
            LockOutcome::AlreadyLocked(owner) => {
                return Err(OrchestratorError::AlreadyRunning {
                    state_dir,
                    pid: owner.map(|o| o.pid),
                })
            }
        };

        let store = match JobStore::open(&state_dir) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                let _ = locks.release(&daemon_lock);
                return Err(e.into());
            }
        };

        let plan = derive_plan(&config.scheduler);
        let cancels = CancelRegistry::new();
        let sink = ResultSink::new(Arc::clone(&store), locks.clone());
        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            selector: EngineSelector::new(Arc::clone(&probe)),
            transcoder,
            sink: sink.clone(),
            cancels: cancels.clone(),
        });
        let commands = CommandProcessor::new(
            Arc::clone(&store),
            locks.clone(),
            sink,
            cancels,
            ApiDefaults::from_config(&config),
        );

        info!(
            "Daemon pid {} owns {} ({} worker(s) on {} core(s))",
            locks.pid(),
            state_dir.display(),
            plan.workers,
            plan.total_cores
        );

        Ok(Self {
            config,
            plan,
            store,
            locks,
            probe,
            ctx,
            commands,
            daemon_lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plan(&self) -> &ConcurrencyPlan {
        &self.plan
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn commands(&self) -> &CommandProcessor {
        &self.commands
    }

    /// Brings every unfinished job left by a previous process back to a safe state.
    ///
    /// Nothing moves forward: claims are dropped, interrupted attempts count as
    /// transient failures, and finished jobs only get their disposition re-run.
    pub fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for mut job in self.store.list(&JobFilter::default()) {
            let id = job.id.clone();
            match job.state {
                JobState::Locked => {
                    job.transition(JobState::Queued)
                        .map_err(|e| OrchestratorError::Store(e.into()))?;
                    job.note("claim dropped after restart");
                    self.store.update(&job)?;
                    report.requeued += 1;
                }
                JobState::Running => {
                    remove_partial(&job.destination_path);
                    job.record_error(ErrorKind::Interrupted, "interrupted by daemon restart");
                    match decide(&job, now) {
                        RetryDecision::Retry { .. } => {
                            job.schedule_retry(now)
                                .map_err(|e| OrchestratorError::Store(e.into()))?;
                            self.store.update(&job)?;
                            report.retrying += 1;
                        }
                        RetryDecision::GiveUp(reason) => {
                            job.note(format!("giving up: {}", reason));
                            job.transition(JobState::Failed)
                                .map_err(|e| OrchestratorError::Store(e.into()))?;
                            self.store.update(&job)?;
                            self.finalize(&id)?;
                            report.failed += 1;
                            continue;
                        }
                    }
                }
                JobState::Completed | JobState::Failed => {
                    self.finalize(&id)?;
                    report.finalized += 1;
                    continue;
                }
                _ => {}
            }

            let Some(job) = self.store.get(&id).filter(|j| !j.is_terminal()) else {
                continue;
            };
            let Some(token) = &job.lock_token else {
                continue;
            };
            if !job.source_path.exists() {
                continue;
            }
            match self.locks.adopt(&job.source_path, token)? {
                Some(_) => report.locks_adopted += 1,
                None => {
                    warn!(
                        "Job {}: lock on {} is held by another live process",
                        job.id,
                        job.source_path.display()
                    );
                    report.locks_contested += 1;
                }
            }
        }

        info!("Recovery: {}", report);
        Ok(report)
    }

    fn finalize(&self, id: &str) -> Result<(), OrchestratorError> {
        match self.ctx.sink.finalize(id) {
            Ok(_) => Ok(()),
            Err(SinkError::Store(e)) if e.is_systemic() => Err(e.into()),
            Err(e) => {
                error!("Job {}: result sink failed during recovery: {}", id, e);
                Ok(())
            }
        }
    }

    /// Recovers, then runs monitors, workers and the command processor until
    /// `shutdown` turns true. Monitors and workers fail independently.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), OrchestratorError> {
        self.recover()?;
        let engines = self.probe.descriptors().await;
        for engine in &engines {
            info!("Engine {}", engine);
        }

        let mut tasks: JoinSet<TaskExit> = JoinSet::new();

        for folder in &self.config.watch_folders {
            let name = folder.name.clone();
            match WatchFolderMonitor::new(
                folder.clone(),
                &self.config,
                Arc::clone(&self.store),
                self.locks.clone(),
            ) {
                Ok(monitor) => {
                    let rx = shutdown.clone();
                    tasks.spawn(async move {
                        let result = Arc::new(monitor).run(rx).await;
                        TaskExit::Monitor(name, result)
                    });
                }
                Err(e) => error!("{}", e),
            }
        }

        let poll = Duration::from_millis(self.config.scheduler.poll_interval_ms);
        for id in 0..self.plan.workers as usize {
            let worker = Worker::new(id, Arc::clone(&self.ctx), poll, shutdown.clone());
            tasks.spawn(async move { TaskExit::Worker(id, worker.run().await) });
        }

        let commands = self.commands.clone();
        let mut rx = shutdown.clone();
        tasks.spawn(async move { TaskExit::Commands(run_commands(commands, poll, &mut rx).await) });

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskExit::Monitor(name, Err(e))) => {
                    error!("Monitor '{}' stopped: {}", name, e);
                    failures.push(format!("monitor '{}': {}", name, e));
                }
                Ok(TaskExit::Worker(id, Err(e))) => {
                    error!("Worker {} stopped: {}", id, e);
                    failures.push(format!("worker {}: {}", id, e));
                }
                Ok(TaskExit::Commands(Err(e))) => {
                    error!("Command processor stopped: {}", e);
                    failures.push(format!("command processor: {}", e));
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Task panicked: {}", e);
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            info!("Daemon stopped");
            Ok(())
        } else {
            Err(OrchestratorError::TasksFailed(failures))
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release(&self.daemon_lock) {
            warn!("Failed to release {}: {}", self.daemon_lock.lock_path.display(), e);
        }
    }
}

async fn run_commands(
    commands: CommandProcessor,
    poll: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), CommandError> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let processor = commands.clone();
        match tokio::task::spawn_blocking(move || processor.process_pending()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!("Applied {} operator command(s)", n),
            Ok(Err(e)) => return Err(e),
            Err(e) => error!("Command processing task failed: {}", e),
        }
        tokio::select! {
            _ = sleep(poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

fn remove_partial(destination: &Path) {
    let partial = partial_output_path(destination);
    match fs::remove_file(&partial) {
        Ok(()) => info!("Removed leftover {}", partial.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", partial.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::new_job;
    use crate::scheduler::tests::{ScriptedTranscoder, Step};
    use tempfile::TempDir;

    fn config(root: &Path) -> Config {
        let input = root.join("in");
        let output = root.join("out");
        fs::create_dir_all(&input).unwrap();
        Config::parse_toml(&format!(
            r#"
version = 2
[state]
state_dir = "{state}"
[scheduler]
workers = 1
poll_interval_ms = 10
[[watch_folders]]
name = "tv"
input_dir = "{input}"
output_dir = "{output}"
"#,
            state = root.join("state").display(),
            input = input.display(),
            output = output.display(),
        ))
        .unwrap()
    }

    fn orchestrator(root: &Path) -> Orchestrator {
        Orchestrator::with_parts(
            config(root),
            Arc::new(ScriptedTranscoder::new(vec![Step::Write(b"ok")])),
            Arc::new(EngineProbe::with_search_path(Vec::new(), Vec::new())),
        )
        .unwrap()
    }

    #[test]
    fn test_single_daemon_per_state_dir() {
        let dir = TempDir::new().unwrap();
        let first = orchestrator(dir.path());
        assert_eq!(running_daemon_pid(&dir.path().join("state")), Some(std::process::id()));

        let err = Orchestrator::with_parts(
            config(dir.path()),
            Arc::new(ScriptedTranscoder::new(vec![Step::Empty])),
            Arc::new(EngineProbe::with_search_path(Vec::new(), Vec::new())),
        )
        .err()
        .unwrap();
        assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));

        drop(first);
        assert!(!daemon_lock_path(&dir.path().join("state")).exists());
        orchestrator(dir.path());
    }

    #[test]
    fn test_restart_with_reused_pid_takes_over_state_dir() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        fs::create_dir_all(&state).unwrap();
        // A previous run of this process crashed holding the guard under the same pid.
        let leftover = crate::lock::LockInfo {
            pid: std::process::id(),
            instance: "crashed-incarnation".to_string(),
            token: "crashed-incarnation".to_string(),
            acquired_at: Utc::now() - chrono::Duration::days(3),
        };
        fs::write(daemon_lock_path(&state), serde_json::to_vec(&leftover).unwrap()).unwrap();

        let orch = orchestrator(dir.path());
        let info = read_lock(&daemon_lock_path(&state)).unwrap().unwrap();
        assert_eq!(info.token, orch.daemon_lock.token);
        assert_eq!(info.instance, crate::lock::process_instance());
    }

    #[test]
    fn test_unknown_preferred_engine_refuses_start() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.watch_folders[0].capabilities = vec!["upscale=waifu9000".parse().unwrap()];

        assert!(check(&config)
            .issues
            .iter()
            .any(|i| i.contains("no upscale engine named 'waifu9000'")));
        let err = Orchestrator::with_parts(
            config,
            Arc::new(ScriptedTranscoder::new(vec![Step::Empty])),
            Arc::new(EngineProbe::with_search_path(Vec::new(), Vec::new())),
        )
        .err()
        .unwrap();
        assert!(matches!(err, OrchestratorError::Check { .. }));
        assert!(!daemon_lock_path(&dir.path().join("state")).exists());
    }

    #[test]
    fn test_recover_rolls_back_claims() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path());
        let store = orch.store();

        let locked = dir.path().join("in/locked.mkv");
        let running = dir.path().join("in/running.mkv");
        for path in [&locked, &running] {
            fs::write(path, b"x").unwrap();
            store.enqueue(new_job(path.to_str().unwrap())).unwrap();
        }
        // Claim both; start an attempt on the second.
        let a = store.next_ready(Utc::now()).unwrap().unwrap();
        let mut b = store.next_ready(Utc::now()).unwrap().unwrap();
        b.begin_attempt().unwrap();
        let b = store.update(&b).unwrap();

        let report = orch.recover().unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.retrying, 1);

        let a = store.get(&a.id).unwrap();
        assert_eq!(a.state, JobState::Queued);
        assert_eq!(a.attempt_count, 0);

        let b = store.get(&b.id).unwrap();
        assert_eq!(b.state, JobState::Retrying);
        assert_eq!(b.attempt_count, 1);
        assert_eq!(b.last_error.as_ref().unwrap().kind, ErrorKind::Interrupted);
        assert!(b.is_ready(Utc::now()));
    }

    #[test]
    fn test_recover_fails_exhausted_interrupted_job() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path());
        let store = orch.store();
        let source = dir.path().join("in/a.mkv");
        fs::write(&source, b"x").unwrap();
        let mut job = new_job(source.to_str().unwrap());
        job.max_attempts = 1;
        job.disposition.error_dir = dir.path().join("in/error");
        store.enqueue(job).unwrap();
        let mut job = store.next_ready(Utc::now()).unwrap().unwrap();
        job.begin_attempt().unwrap();
        let job = store.update(&job).unwrap();

        let report = orch.recover().unwrap();
        assert_eq!(report.failed, 1);
        let job = store.get(&job.id).unwrap();
        assert_eq!(job.state, JobState::Errored);
        assert_eq!(job.attempt_count, 1);
        assert!(dir.path().join("in/error/a.mkv").exists());
    }

    #[test]
    fn test_check_reports_problems() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.transcoder.program = "/nonexistent/transcoder".to_string();
        config.watch_folders[0].input_dir = dir.path().join("missing");
        config.watch_folders[0].file_patterns = vec!["[".to_string()];

        let report = check(&config);
        assert!(!report.is_ok());
        assert!(report.issues.iter().any(|i| i.contains("not found")));
        assert!(report.issues.iter().any(|i| i.contains("not readable")));
        assert!(report.issues.iter().any(|i| i.contains("invalid pattern")));
        // Nothing was created.
        assert!(!dir.path().join("state").exists());
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_run_processes_dropped_file_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.stability.interval_ms = 10;
        config.watch_folders[0].min_size_bytes = 1;
        config.watch_folders[0].poll_interval_ms = 10;
        let orch = Orchestrator::with_parts(
            config,
            Arc::new(ScriptedTranscoder::new(vec![Step::Write(b"encoded")])),
            Arc::new(EngineProbe::with_search_path(Vec::new(), Vec::new())),
        )
        .unwrap();
        fs::write(dir.path().join("in/a.mkv"), b"source").unwrap();

        let (tx, rx) = watch::channel(false);
        let store = Arc::clone(orch.store());
        let stopper = tokio::spawn(async move {
            for _ in 0..500 {
                let done = store
                    .list(&JobFilter::all())
                    .iter()
                    .any(|j| j.state == JobState::Archived);
                if done {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
            tx.send(true).unwrap();
        });
        orch.run(rx).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(fs::read(dir.path().join("out/a.mkv")).unwrap(), b"encoded");
        assert!(dir.path().join("in/completed/a.mkv").exists());
    }
}
