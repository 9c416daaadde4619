//! Scheduler configuration.
//!
//! Strongly-typed configuration deserialized by the embedding binary (the
//! server loads it via the `config` crate from environment variables).

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the scheduler, dispatcher, runner, and recovery loops.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Name of this scheduler instance; recovery scans are scoped to it.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Prefix for the store's relational table names.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Static per-job-name cron expressions, consulted when a schedule
    /// request carries no expression.
    #[serde(default)]
    pub cron_expressions: HashMap<String, String>,

    /// Maximum number of firings executing in parallel.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum number of due triggers acquired per dispatcher tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Force acquisition under the store-level lock even for batch size 1.
    #[serde(default)]
    pub lock_on_acquire: bool,

    /// Dispatcher tick interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Error-recovery loop interval in milliseconds.
    #[serde(default = "default_job_recovery_delay_ms")]
    pub job_recovery_delay_ms: u64,

    /// Blocked-trigger recovery settings.
    #[serde(default)]
    pub blocked_recovery: BlockedRecoveryConfig,
}

/// Opt-in recovery of triggers stuck in the Blocked state.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockedRecoveryConfig {
    /// Job names eligible for blocked recovery. Empty disables the loop.
    #[serde(default)]
    pub jobs: Vec<String>,

    /// Scan interval in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Max allowed delay between the trigger's last fire time and now
    /// before the trigger is forcibly recreated, in milliseconds.
    #[serde(default = "default_max_fire_delay_ms")]
    pub max_fire_delay_ms: u64,
}

fn default_instance_name() -> String {
    "copper-metronome".to_string()
}

fn default_table_prefix() -> String {
    "cm_".to_string()
}

fn default_max_concurrency() -> usize {
    25
}

fn default_batch_size() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_job_recovery_delay_ms() -> u64 {
    15_000
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_max_fire_delay_ms() -> u64 {
    300_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            table_prefix: default_table_prefix(),
            cron_expressions: HashMap::new(),
            max_concurrency: default_max_concurrency(),
            batch_size: default_batch_size(),
            lock_on_acquire: false,
            poll_interval_ms: default_poll_interval_ms(),
            job_recovery_delay_ms: default_job_recovery_delay_ms(),
            blocked_recovery: BlockedRecoveryConfig::default(),
        }
    }
}

impl Default for BlockedRecoveryConfig {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            check_interval_ms: default_check_interval_ms(),
            max_fire_delay_ms: default_max_fire_delay_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Looks up the statically configured cron expression for a job name.
    #[must_use]
    pub fn cron_for(&self, job_name: &str) -> Option<&str> {
        self.cron_expressions.get(job_name).map(String::as_str)
    }

    /// Returns true when acquisition must run under the store-level lock.
    /// Batch acquisition always locks; two unlocked passes could otherwise
    /// claim overlapping trigger sets.
    #[must_use]
    pub fn acquisition_locked(&self) -> bool {
        self.lock_on_acquire || self.batch_size > 1
    }

    /// Dispatcher tick interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Error-recovery loop interval.
    #[must_use]
    pub fn job_recovery_delay(&self) -> Duration {
        Duration::from_millis(self.job_recovery_delay_ms)
    }
}

impl BlockedRecoveryConfig {
    /// Scan interval.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Staleness threshold as a chrono duration for fire-time arithmetic.
    #[must_use]
    pub fn max_fire_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.max_fire_delay_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_correct_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.instance_name, "copper-metronome");
        assert_eq!(config.table_prefix, "cm_");
        assert_eq!(config.max_concurrency, 25);
        assert_eq!(config.batch_size, 1);
        assert!(!config.lock_on_acquire);
        assert_eq!(config.job_recovery_delay_ms, 15_000);
        assert!(config.blocked_recovery.jobs.is_empty());
        assert_eq!(config.blocked_recovery.max_fire_delay_ms, 300_000);
    }

    #[test]
    fn batch_acquisition_forces_lock() {
        let config = SchedulerConfig {
            batch_size: 5,
            ..Default::default()
        };
        assert!(config.acquisition_locked());

        let config = SchedulerConfig::default();
        assert!(!config.acquisition_locked());

        let config = SchedulerConfig {
            lock_on_acquire: true,
            ..Default::default()
        };
        assert!(config.acquisition_locked());
    }

    #[test]
    fn cron_for_consults_static_table() {
        let mut config = SchedulerConfig::default();
        config
            .cron_expressions
            .insert("Nightly".to_string(), "0 0 2 * * *".to_string());

        assert_eq!(config.cron_for("Nightly"), Some("0 0 2 * * *"));
        assert_eq!(config.cron_for("Unknown"), None);
    }

    #[test]
    fn config_deserializes_with_partial_input() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"max_concurrency": 4}"#).expect("deserialize");
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.batch_size, 1);
    }
}
