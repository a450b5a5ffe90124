//! Worker pool sizing.
//!
//! Derives the number of scheduler workers from the core count unless the
//! configuration sets it explicitly.

use crate::config::SchedulerConfig;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of scheduler workers (concurrently running jobs)
    pub workers: u32,
}

impl ConcurrencyPlan {
    /// Derive a plan, detecting the core count via num_cpus.
    pub fn derive(cfg: &SchedulerConfig) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Uses the explicit worker count if non-zero, otherwise derives it from `total_cores`.
    pub fn derive_with_cores(cfg: &SchedulerConfig, total_cores: u32) -> Self {
        let workers = if cfg.workers > 0 {
            cfg.workers
        } else {
            derive_workers(total_cores)
        };
        Self {
            total_cores,
            workers,
        }
    }
}

/// Derive worker count based on core count
/// - 2 workers for 16+ cores
/// - 1 worker otherwise (sequential processing)
fn derive_workers(cores: u32) -> u32 {
    if cores >= 16 {
        2
    } else {
        1
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &SchedulerConfig) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scheduler(workers: u32) -> SchedulerConfig {
        SchedulerConfig {
            workers,
            poll_interval_ms: 1000,
            job_timeout_secs: 3600,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Without an explicit setting: 2 workers at 16+ cores, 1 below.
        #[test]
        fn prop_worker_derivation(cores in 1u32..256) {
            let plan = ConcurrencyPlan::derive_with_cores(&scheduler(0), cores);
            prop_assert_eq!(plan.total_cores, cores);
            let expected = if cores >= 16 { 2 } else { 1 };
            prop_assert_eq!(plan.workers, expected);
        }

        // An explicit worker count is used unchanged.
        #[test]
        fn prop_explicit_workers(cores in 1u32..256, explicit in 1u32..64) {
            let plan = ConcurrencyPlan::derive_with_cores(&scheduler(explicit), cores);
            prop_assert_eq!(plan.workers, explicit);
        }
    }

    #[test]
    fn test_derive_plan_detects_cores() {
        let plan = derive_plan(&scheduler(0));
        assert!(plan.total_cores >= 1);
        assert!(plan.workers >= 1);
    }
}
