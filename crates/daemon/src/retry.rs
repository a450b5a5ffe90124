//! Retry decisions.
//!
//! [`decide`] is a pure function of the job record and the current time. It is the
//! only place that turns a failed attempt into either another attempt or a
//! terminal failure.

use crate::job::{ErrorClass, JobRecord};
use chrono::{DateTime, Duration, Utc};

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again once `at` has passed.
    Retry { after: Duration, at: DateTime<Utc> },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    AttemptsExhausted,
    PermanentError,
    /// The job has no recorded error to judge.
    NoError,
}

impl std::fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GiveUpReason::AttemptsExhausted => write!(f, "attempts exhausted"),
            GiveUpReason::PermanentError => write!(f, "permanent error"),
            GiveUpReason::NoError => write!(f, "no error recorded"),
        }
    }
}

/// Fixed-delay retry policy.
///
/// Retry iff attempts remain and the last error is transient;
/// `next_retry_at = now + retry_delay`.
pub fn decide(job: &JobRecord, now: DateTime<Utc>) -> RetryDecision {
    let Some(error) = &job.last_error else {
        return RetryDecision::GiveUp(GiveUpReason::NoError);
    };
    if error.kind.class() != ErrorClass::Transient {
        return RetryDecision::GiveUp(GiveUpReason::PermanentError);
    }
    if job.attempt_count >= job.max_attempts {
        return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
    }
    let after = job.retry_delay();
    RetryDecision::Retry {
        after,
        at: now + after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::new_job;
    use crate::job::{ErrorKind, JobState};
    use proptest::prelude::*;

    fn failed(attempts: u32, max: u32, kind: ErrorKind) -> JobRecord {
        let mut job = new_job("/in/a.mkv");
        job.max_attempts = max;
        job.attempt_count = attempts;
        job.state = JobState::Running;
        job.record_error(kind, "boom");
        job
    }

    #[test]
    fn test_transient_with_attempts_left_retries() {
        let now = Utc::now();
        let job = failed(1, 3, ErrorKind::Timeout);
        assert_eq!(
            decide(&job, now),
            RetryDecision::Retry {
                after: Duration::seconds(5),
                at: now + Duration::seconds(5)
            }
        );
    }

    #[test]
    fn test_exhausted_gives_up() {
        let job = failed(3, 3, ErrorKind::ToolFailed);
        assert_eq!(
            decide(&job, Utc::now()),
            RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted)
        );
    }

    #[test]
    fn test_permanent_gives_up_immediately() {
        for kind in [
            ErrorKind::CorruptInput,
            ErrorKind::UnsupportedFormat,
            ErrorKind::Configuration,
            ErrorKind::Cancelled,
            ErrorKind::InputMissing,
        ] {
            let job = failed(1, 5, kind);
            assert_eq!(
                decide(&job, Utc::now()),
                RetryDecision::GiveUp(GiveUpReason::PermanentError),
                "{}",
                kind
            );
        }
    }

    #[test]
    fn test_no_error_gives_up() {
        let job = new_job("/in/a.mkv");
        assert_eq!(
            decide(&job, Utc::now()),
            RetryDecision::GiveUp(GiveUpReason::NoError)
        );
    }

    fn kind_strategy() -> impl Strategy<Value = ErrorKind> {
        proptest::sample::select(vec![
            ErrorKind::Timeout,
            ErrorKind::ToolFailed,
            ErrorKind::ToolSignalled,
            ErrorKind::OutputInvalid,
            ErrorKind::FsContention,
            ErrorKind::Interrupted,
            ErrorKind::CorruptInput,
            ErrorKind::UnsupportedFormat,
            ErrorKind::InputMissing,
            ErrorKind::Configuration,
            ErrorKind::Cancelled,
        ])
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_retry_iff_transient_and_attempts_left(
            max in 1u32..10,
            attempts in 0u32..12,
            kind in kind_strategy(),
            delay in 0u64..86_400,
        ) {
            let attempts = attempts.min(max);
            let mut job = failed(attempts, max, kind);
            job.retry_delay_secs = delay;
            let now = Utc::now();

            let expect_retry = kind.is_transient() && attempts < max;
            match decide(&job, now) {
                RetryDecision::Retry { after, at } => {
                    prop_assert!(expect_retry);
                    prop_assert_eq!(after, Duration::seconds(delay as i64));
                    prop_assert_eq!(at, now + after);
                }
                RetryDecision::GiveUp(_) => prop_assert!(!expect_retry),
            }
        }

        // Same input, same answer.
        #[test]
        fn prop_decide_is_deterministic(max in 1u32..10, attempts in 0u32..10, kind in kind_strategy()) {
            let job = failed(attempts.min(max), max, kind);
            let now = Utc::now();
            prop_assert_eq!(decide(&job, now), decide(&job, now));
        }
    }
}
