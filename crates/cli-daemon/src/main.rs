//! CLI entry point for reelwatch
//!
//! `reelwatch run` starts the daemon; every other subcommand inspects the job
//! store or hands a command to the running daemon through its command drop box.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use reelwatch::config::{CapabilityRequest, Config};
use reelwatch::lock::pid_alive;
use reelwatch::{
    check, registry, running_daemon_pid, write_command, Command, EngineProbe, JobFilter,
    JobRecord, JobState, JobStore, Orchestrator,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// reelwatch - watch-folder driven media transcoding orchestrator
#[derive(Parser, Debug)]
#[command(name = "reelwatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "reelwatch.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run monitors and workers until SIGINT/SIGTERM
    Run,
    /// Ask the running daemon to shut down
    Stop,
    /// List jobs
    List {
        /// Only jobs in this state (includes finished jobs)
        #[arg(long)]
        state: Option<JobState>,
        /// Only jobs from this watch folder
        #[arg(long)]
        folder: Option<String>,
        /// Include archived and errored jobs
        #[arg(short, long)]
        all: bool,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one job with its processing log
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Retry a waiting job now, or start an errored job over
    Retry { id: String },
    /// Cancel a job, killing its transcoder if it is running
    Cancel { id: String },
    /// Submit a file directly
    Submit {
        source: PathBuf,
        destination: PathBuf,
        #[arg(long, default_value = "default")]
        preset: String,
        /// Required capability, optionally with a preferred engine (upscale=realesrgan)
        #[arg(long = "capability", value_name = "CAP[=ENGINE]")]
        capabilities: Vec<CapabilityRequest>,
        /// Preset override passed to the transcoder
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        overrides: Vec<(String, String)>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        retry_delay_secs: Option<u64>,
    },
    /// Validate the configuration and directories without starting anything
    Check,
    /// Probe every known engine and print its availability
    Engines,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    match args.command {
        Cmd::Run => run(&args.config).await,
        Cmd::Stop => stop(&load(&args.config)?),
        Cmd::List {
            state,
            folder,
            all,
            json,
        } => list(&load(&args.config)?, state, folder, all, json),
        Cmd::Show { id, json } => show(&load(&args.config)?, &id, json),
        Cmd::Retry { id } => {
            let config = load(&args.config)?;
            let job = resolve(&config, &id)?;
            send(&config, &Command::Retry { job_id: job.id })
        }
        Cmd::Cancel { id } => {
            let config = load(&args.config)?;
            let job = resolve(&config, &id)?;
            send(&config, &Command::Cancel { job_id: job.id })
        }
        Cmd::Submit {
            source,
            destination,
            preset,
            capabilities,
            overrides,
            max_retries,
            retry_delay_secs,
        } => {
            let config = load(&args.config)?;
            let command = Command::Submit {
                source: absolute(&source)?,
                destination: absolute(&destination)?,
                preset,
                overrides: overrides.into_iter().collect::<BTreeMap<_, _>>(),
                capabilities,
                max_retries,
                retry_delay_secs,
            };
            send(&config, &command)
        }
        Cmd::Check => check_config(&args.config),
        Cmd::Engines => engines(&load(&args.config)?).await,
    }
}

fn load(path: &Path) -> Result<Config> {
    Config::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to read current directory")?
        .join(path))
}

async fn run(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    info!("reelwatch starting with {}", config_path.display());
    for folder in &config.watch_folders {
        info!(
            "  {}: {} -> {} ({})",
            folder.name,
            folder.input_dir.display(),
            folder.output_dir.display(),
            folder.on_complete
        );
    }

    let orchestrator = Orchestrator::new(config).context("Failed to start daemon")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(shutdown_rx).await.context("Daemon stopped on errors")
}

fn stop(config: &Config) -> Result<()> {
    let state_dir = &config.state.state_dir;
    let pid = running_daemon_pid(state_dir)
        .filter(|pid| pid_alive(*pid))
        .ok_or_else(|| anyhow!("no daemon is running for {}", state_dir.display()))?;

    let pid_i32 = i32::try_from(pid).with_context(|| format!("invalid pid {}", pid))?;
    if unsafe { libc::kill(pid_i32, libc::SIGTERM) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to signal daemon pid {}", pid));
    }
    println!("Sent SIGTERM to daemon pid {}", pid);

    for _ in 0..300 {
        if !pid_alive(pid) {
            println!("Daemon stopped");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("daemon pid {} is still running after 30s", pid)
}

fn open_store(config: &Config) -> Result<JobStore> {
    JobStore::open_read_only(&config.state.state_dir).with_context(|| {
        format!(
            "Failed to read job store at {}",
            config.state.state_dir.display()
        )
    })
}

fn resolve(config: &Config, id: &str) -> Result<JobRecord> {
    open_store(config)?
        .resolve(id)
        .with_context(|| format!("No unique job matches '{}'", id))
}

fn list(
    config: &Config,
    state: Option<JobState>,
    folder: Option<String>,
    all: bool,
    json: bool,
) -> Result<()> {
    let filter = JobFilter {
        state,
        folder,
        include_terminal: all,
    };
    let jobs = open_store(config)?.list(&filter);

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    println!(
        "{:<8}  {:<11}  {:>8}  {:<12}  {:<19}  SOURCE",
        "ID", "STATE", "ATTEMPTS", "ORIGIN", "UPDATED"
    );
    for job in jobs {
        println!(
            "{:<8}  {:<11}  {:>8}  {:<12}  {:<19}  {}",
            &job.id[..8.min(job.id.len())],
            job.state,
            format!("{}/{}", job.attempt_count, job.max_attempts),
            job.folder_name().unwrap_or("api"),
            job.updated_at.format("%Y-%m-%d %H:%M:%S"),
            job.source_path.display()
        );
    }
    Ok(())
}

fn show(config: &Config, id: &str, json: bool) -> Result<()> {
    let job = resolve(config, id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("Job          {}", job.id);
    println!("State        {}", job.state);
    println!("Source       {}", job.source_path.display());
    println!("Destination  {}", job.destination_path.display());
    println!("Preset       {}", job.config.preset);
    for (key, value) in &job.config.overrides {
        println!("  {} = {}", key, value);
    }
    println!("Attempts     {}/{}", job.attempt_count, job.max_attempts);
    if let Some(at) = job.next_retry_at {
        println!("Next retry   {}", at.to_rfc3339());
    }
    if let Some(progress) = job.progress {
        println!("Progress     {:.1}%", progress);
    }
    if let Some(error) = &job.last_error {
        println!("Last error   {}", error);
    }
    for engine in &job.engines {
        match &engine.fallback_from {
            Some(from) => println!(
                "Engine       {}: {} (fallback from {})",
                engine.capability, engine.name, from
            ),
            None => println!("Engine       {}: {}", engine.capability, engine.name),
        }
    }
    if let Some(archived) = &job.archived_input {
        println!("Original     {}", archived.display());
    }
    println!();
    println!("Log:");
    for entry in &job.log {
        println!("  {}  {}", entry.at.format("%Y-%m-%d %H:%M:%S"), entry.message);
    }
    Ok(())
}

fn send(config: &Config, command: &Command) -> Result<()> {
    let dir = config.state.state_dir.join(reelwatch::store::COMMANDS_DIR);
    let path = write_command(&dir, command).context("Failed to write command file")?;
    println!("Queued command {}", path.display());
    match running_daemon_pid(&config.state.state_dir).filter(|pid| pid_alive(*pid)) {
        Some(pid) => println!("Daemon pid {} will apply it on its next pass", pid),
        None => warn!("No daemon is running; the command will be applied on next start"),
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let mut config = Config::load_from_file(path)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config.apply_env_overrides();

    let report = check(&config);
    for note in &report.notes {
        println!("ok    {}", note);
    }
    for issue in &report.issues {
        println!("error {}", issue);
    }
    if report.is_ok() {
        println!("Configuration OK");
        Ok(())
    } else {
        Err(reelwatch::OrchestratorError::Check {
            issues: report.issues,
        })
        .context("Configuration check failed")
    }
}

async fn engines(config: &Config) -> Result<()> {
    let probe = EngineProbe::new(registry(&config.engines));
    for engine in probe.refresh().await {
        println!("{}", engine);
    }
    Ok(())
}
