//! Runs the configured transcoder program as a child process.

use super::{ExitReport, ExitStatusKind, TranscodeError, TranscodeRequest, Transcoder};
use crate::config::TranscoderConfig;
use async_trait::async_trait;
use log::{debug, warn};
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;

/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Substitutes placeholders in each template argument.
///
/// `{input}`, `{output}`, `{preset}`, `{engines}` (`capability=name,...`) and
/// `{overrides}` (`key=value,...`). An argument that is exactly `{input}` or
/// `{output}` is passed as the raw path.
pub fn render_args(template: &[String], request: &TranscodeRequest) -> Vec<OsString> {
    let engines = request
        .engines
        .iter()
        .map(|e| format!("{}={}", e.capability, e.name))
        .collect::<Vec<_>>()
        .join(",");
    let overrides = request
        .config
        .overrides
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    template
        .iter()
        .map(|arg| match arg.as_str() {
            "{input}" => request.input.clone().into_os_string(),
            "{output}" => request.output.clone().into_os_string(),
            _ => OsString::from(
                arg.replace("{input}", &request.input.to_string_lossy())
                    .replace("{output}", &request.output.to_string_lossy())
                    .replace("{preset}", &request.config.preset)
                    .replace("{engines}", &engines)
                    .replace("{overrides}", &overrides),
            ),
        })
        .collect()
}

/// Extracts a percent-complete value from one line of tool output.
///
/// Understands `progress=NN` and the last `NN%` / `NN.N%` token on the line.
pub fn parse_progress(line: &str) -> Option<f32> {
    if let Some(rest) = line.split("progress=").nth(1) {
        let number: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(value) = number.parse::<f32>() {
            return (0.0..=100.0).contains(&value).then_some(value);
        }
    }

    let percent = line.rfind('%')?;
    let head = &line[..percent];
    let start = head
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let value = head[start..].parse::<f32>().ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}

/// Drains stderr, keeping a bounded tail and the latest progress heartbeat.
async fn drain_stderr<R: AsyncRead + Unpin>(mut reader: R) -> (Vec<u8>, Option<f32>) {
    let mut tail = Vec::new();
    let mut line = Vec::with_capacity(256);
    let mut progress = None;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > MAX_STDERR_BYTES {
            let excess = tail.len() - MAX_STDERR_BYTES;
            tail.drain(..excess);
        }
        // Progress lines are often terminated by '\r' only.
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                if let Some(p) = parse_progress(&String::from_utf8_lossy(&line)) {
                    progress = Some(p);
                }
                line.clear();
            } else if line.len() < 4096 {
                line.push(byte);
            }
        }
    }
    if let Some(p) = parse_progress(&String::from_utf8_lossy(&line)) {
        progress = Some(p);
    }
    (tail, progress)
}

/// Resolves when `cancel` becomes true; never if the sender goes away.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sends SIGKILL to the child's whole process group.
fn kill_process_group(pid: Option<u32>) -> bool {
    match pid {
        Some(pid) if pid > 0 && pid <= i32::MAX as u32 => {
            unsafe { libc::killpg(pid as i32, libc::SIGKILL) == 0 }
        }
        _ => false,
    }
}

enum Ended {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// The external tool configured under `[transcoder]`.
#[derive(Debug, Clone)]
pub struct CommandTranscoder {
    program: String,
    args: Vec<String>,
}

impl CommandTranscoder {
    pub fn new(config: &TranscoderConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Builds the command without running it. No shell is involved.
    pub fn build_command(&self, request: &TranscodeRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(render_args(&self.args, request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Own process group, so a kill reaches every helper the tool spawned.
            .process_group(0);
        cmd
    }
}

#[async_trait]
impl Transcoder for CommandTranscoder {
    async fn execute(
        &self,
        request: &TranscodeRequest,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExitReport, TranscodeError> {
        let mut cmd = self.build_command(request);
        debug!("Job {}: running {:?}", request.job_id, cmd.as_std());

        let mut child = cmd.spawn().map_err(|source| TranscodeError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();

        let reader = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr)));

        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status?),
            _ = tokio::time::sleep(timeout) => Ended::TimedOut,
            _ = cancelled(cancel) => Ended::Cancelled,
        };

        let status = match ended {
            Ended::Exited(status) => match (status.code(), status.signal()) {
                (Some(0), _) => ExitStatusKind::Success,
                (Some(code), _) => ExitStatusKind::Failure(code),
                (None, Some(signal)) => ExitStatusKind::Signalled(signal),
                (None, None) => ExitStatusKind::Signalled(0),
            },
            Ended::TimedOut | Ended::Cancelled => {
                if !kill_process_group(pid) {
                    child.start_kill()?;
                }
                child.wait().await?;
                if matches!(ended, Ended::TimedOut) {
                    warn!("Job {}: transcoder exceeded {:?}, killed", request.job_id, timeout);
                    ExitStatusKind::TimedOut
                } else {
                    warn!("Job {}: transcoder cancelled, killed", request.job_id);
                    ExitStatusKind::Cancelled
                }
            }
        };

        let (tail, last_progress) = match reader {
            Some(handle) => handle.await.unwrap_or_default(),
            None => (Vec::new(), None),
        };

        Ok(ExitReport {
            status,
            stderr_tail: String::from_utf8_lossy(&tail).into_owned(),
            last_progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Capability;
    use crate::job::{ProcessingConfig, SelectedEngine};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Instant;

    fn request() -> TranscodeRequest {
        let mut overrides = BTreeMap::new();
        overrides.insert("crf".to_string(), "18".to_string());
        overrides.insert("scale".to_string(), "2".to_string());
        TranscodeRequest {
            job_id: "job-1".to_string(),
            input: PathBuf::from("/in/my movie.mkv"),
            output: PathBuf::from("/out/my movie.partial.mkv"),
            config: ProcessingConfig {
                preset: "film".to_string(),
                overrides,
            },
            engines: vec![SelectedEngine {
                capability: Capability::Upscale,
                name: "realesrgan".to_string(),
                priority: 0,
                fallback_from: None,
            }],
        }
    }

    fn sh(script: &str) -> CommandTranscoder {
        CommandTranscoder::new(&TranscoderConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        })
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[test]
    fn test_render_args_substitutes_without_splitting() {
        let template: Vec<String> = ["-i", "{input}", "-o", "{output}", "--preset={preset}", "{engines}", "{overrides}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let args = render_args(&template, &request());
        assert_eq!(
            args,
            vec![
                OsString::from("-i"),
                OsString::from("/in/my movie.mkv"),
                OsString::from("-o"),
                OsString::from("/out/my movie.partial.mkv"),
                OsString::from("--preset=film"),
                OsString::from("upscale=realesrgan"),
                OsString::from("crf=18,scale=2"),
            ]
        );
    }

    #[test]
    fn test_render_args_shell_metacharacters_stay_literal() {
        let mut req = request();
        req.input = PathBuf::from("/in/$(rm -rf ~); echo.mkv");
        let args = render_args(&["{input}".to_string()], &req);
        assert_eq!(args, vec![OsString::from("/in/$(rm -rf ~); echo.mkv")]);
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("progress=42"), Some(42.0));
        assert_eq!(parse_progress("progress=continue"), None);
        assert_eq!(parse_progress("encoding 12.5% done"), Some(12.5));
        assert_eq!(parse_progress("[#####     ] 50%"), Some(50.0));
        assert_eq!(parse_progress("100%"), Some(100.0));
        assert_eq!(parse_progress("350%"), None);
        assert_eq!(parse_progress("no numbers"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_parse_progress_percent(value in 0u32..=100, prefix in "[a-z ]{0,10}") {
            let line = format!("{}{}%", prefix, value);
            prop_assert_eq!(parse_progress(&line), Some(value as f32));
        }
    }

    #[tokio::test]
    async fn test_execute_success_and_progress() {
        let t = sh("echo '10%' >&2; printf '55%%\\r' >&2; exit 0");
        let report = t
            .execute(&request(), Duration::from_secs(10), no_cancel())
            .await
            .unwrap();
        assert_eq!(report.status, ExitStatusKind::Success);
        assert_eq!(report.last_progress, Some(55.0));
    }

    #[tokio::test]
    async fn test_execute_failure_keeps_stderr_tail() {
        let t = sh("echo 'moov atom not found' >&2; exit 3");
        let report = t
            .execute(&request(), Duration::from_secs(10), no_cancel())
            .await
            .unwrap();
        assert_eq!(report.status, ExitStatusKind::Failure(3));
        assert!(report.stderr_tail.contains("moov atom not found"));
    }

    #[tokio::test]
    async fn test_execute_bounds_stderr() {
        let t = sh("head -c 200000 /dev/zero | tr '\\0' 'x' >&2; exit 1");
        let report = t
            .execute(&request(), Duration::from_secs(10), no_cancel())
            .await
            .unwrap();
        assert_eq!(report.stderr_tail.len(), MAX_STDERR_BYTES);
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_group() {
        // The grandchild would keep stderr open (and the test hanging) if only
        // the shell were killed.
        let t = sh("sleep 30 & sleep 30; exit 0");
        let started = Instant::now();
        let report = t
            .execute(&request(), Duration::from_millis(200), no_cancel())
            .await
            .unwrap();
        assert_eq!(report.status, ExitStatusKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let t = sh("sleep 30");
        let (tx, rx) = watch::channel(false);
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
            tx
        });
        let report = t
            .execute(&request(), Duration::from_secs(30), rx)
            .await
            .unwrap();
        assert_eq!(report.status, ExitStatusKind::Cancelled);
        drop(canceller.await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let t = CommandTranscoder::new(&TranscoderConfig {
            program: "/nonexistent/reelwatch-transcode".to_string(),
            args: vec![],
        });
        let err = t
            .execute(&request(), Duration::from_secs(1), no_cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::job::ErrorKind::Configuration);
    }
}
