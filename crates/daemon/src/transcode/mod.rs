//! The boundary to the external transcoding tool.
//!
//! The orchestrator only ever sees [`Transcoder::execute`]: it hands over a
//! request, a hard timeout and a cancellation signal, and gets back how the
//! tool ended plus the tail of its stderr. How the tool is invoked stays behind
//! the trait.

mod command;

pub use command::{parse_progress, render_args, CommandTranscoder, MAX_STDERR_BYTES};

use crate::job::{ErrorKind, ProcessingConfig, SelectedEngine};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Errors starting or supervising the tool. Exit codes are not errors; see [`ExitReport`].
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while supervising transcoder: {0}")]
    Io(#[from] io::Error),
}

impl TranscodeError {
    /// Failure kind recorded on the job.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscodeError::Spawn { source, .. }
                if matches!(
                    source.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                ErrorKind::Configuration
            }
            _ => ErrorKind::ToolFailed,
        }
    }
}

/// One invocation of the tool.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub job_id: String,
    pub input: PathBuf,
    /// Where the tool writes; renamed to the job destination on success.
    pub output: PathBuf,
    pub config: ProcessingConfig,
    pub engines: Vec<SelectedEngine>,
}

/// How the tool ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatusKind {
    Success,
    Failure(i32),
    /// Killed by a signal we did not send.
    Signalled(i32),
    TimedOut,
    Cancelled,
}

impl fmt::Display for ExitStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatusKind::Success => write!(f, "success"),
            ExitStatusKind::Failure(code) => write!(f, "exit code {}", code),
            ExitStatusKind::Signalled(signal) => write!(f, "killed by signal {}", signal),
            ExitStatusKind::TimedOut => write!(f, "timed out"),
            ExitStatusKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitReport {
    pub status: ExitStatusKind,
    /// Last bytes of stderr, at most [`MAX_STDERR_BYTES`].
    pub stderr_tail: String,
    /// Last percent-complete heartbeat seen, for display only.
    pub last_progress: Option<f32>,
}

impl ExitReport {
    pub fn success() -> Self {
        Self {
            status: ExitStatusKind::Success,
            stderr_tail: String::new(),
            last_progress: Some(100.0),
        }
    }

    pub fn failure(code: i32, stderr_tail: impl Into<String>) -> Self {
        Self {
            status: ExitStatusKind::Failure(code),
            stderr_tail: stderr_tail.into(),
            last_progress: None,
        }
    }
}

/// Runs the external tool.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Runs one request to completion, killing the tool's whole process group
    /// when `timeout` elapses or `cancel` turns true.
    async fn execute(
        &self,
        request: &TranscodeRequest,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExitReport, TranscodeError>;
}

/// Stderr fragments that mean retrying cannot help.
const PERMANENT_SIGNATURES: &[(&str, ErrorKind)] = &[
    ("invalid data found when processing input", ErrorKind::CorruptInput),
    ("moov atom not found", ErrorKind::CorruptInput),
    ("could not find codec parameters", ErrorKind::CorruptInput),
    ("error while decoding stream", ErrorKind::CorruptInput),
    ("unsupported codec", ErrorKind::UnsupportedFormat),
    ("codec not currently supported", ErrorKind::UnsupportedFormat),
    ("unknown input format", ErrorKind::UnsupportedFormat),
    ("no such file or directory", ErrorKind::InputMissing),
];

/// Failure kind and message for a finished invocation, or `None` on success.
pub fn classify_failure(report: &ExitReport) -> Option<(ErrorKind, String)> {
    let tail = last_line(&report.stderr_tail);
    let with_tail = |what: String| {
        if tail.is_empty() {
            what
        } else {
            format!("{}: {}", what, tail)
        }
    };

    match report.status {
        ExitStatusKind::Success => None,
        ExitStatusKind::TimedOut => Some((ErrorKind::Timeout, "transcoder timed out".to_string())),
        ExitStatusKind::Cancelled => Some((ErrorKind::Cancelled, "cancelled by operator".to_string())),
        ExitStatusKind::Signalled(signal) => Some((
            ErrorKind::ToolSignalled,
            with_tail(format!("transcoder killed by signal {}", signal)),
        )),
        ExitStatusKind::Failure(code) => {
            let lower = report.stderr_tail.to_lowercase();
            let kind = PERMANENT_SIGNATURES
                .iter()
                .find(|(signature, _)| lower.contains(signature))
                .map(|(_, kind)| *kind)
                .unwrap_or(ErrorKind::ToolFailed);
            Some((kind, with_tail(format!("transcoder exited with code {}", code))))
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_not_a_failure() {
        assert!(classify_failure(&ExitReport::success()).is_none());
    }

    #[test]
    fn test_plain_nonzero_exit_is_transient() {
        let report = ExitReport::failure(1, "frame=100\nConversion failed!\n");
        let (kind, message) = classify_failure(&report).unwrap();
        assert_eq!(kind, ErrorKind::ToolFailed);
        assert!(kind.is_transient());
        assert_eq!(message, "transcoder exited with code 1: Conversion failed!");
    }

    #[test]
    fn test_fatal_signatures_are_permanent() {
        let cases = [
            ("input.mkv: Invalid data found when processing input", ErrorKind::CorruptInput),
            ("[mov,mp4] moov atom not found", ErrorKind::CorruptInput),
            ("Unsupported codec with id 0", ErrorKind::UnsupportedFormat),
            ("/in/a.mkv: No such file or directory", ErrorKind::InputMissing),
        ];
        for (stderr, expected) in cases {
            let (kind, _) = classify_failure(&ExitReport::failure(1, stderr)).unwrap();
            assert_eq!(kind, expected, "{}", stderr);
            assert!(!kind.is_transient());
        }
    }

    #[test]
    fn test_timeout_cancel_and_signal() {
        let mut report = ExitReport::failure(0, "");
        report.status = ExitStatusKind::TimedOut;
        assert_eq!(classify_failure(&report).unwrap().0, ErrorKind::Timeout);
        report.status = ExitStatusKind::Cancelled;
        assert_eq!(classify_failure(&report).unwrap().0, ErrorKind::Cancelled);
        report.status = ExitStatusKind::Signalled(9);
        assert_eq!(classify_failure(&report).unwrap().0, ErrorKind::ToolSignalled);
    }

    #[test]
    fn test_spawn_error_kind() {
        let missing = TranscodeError::Spawn {
            program: "nope".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(missing.kind(), ErrorKind::Configuration);
        let busy = TranscodeError::Spawn {
            program: "tool".to_string(),
            source: io::Error::new(io::ErrorKind::Other, "resource busy"),
        };
        assert_eq!(busy.kind(), ErrorKind::ToolFailed);
    }
}
