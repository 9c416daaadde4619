//! Per-firing execution records (fired-trigger history).

use chrono::{DateTime, Utc};
use copper_metronome_core::{FireInstanceId, JobKey, TriggerKey};
use serde::{Deserialize, Serialize};

/// An in-flight or completed firing instance of a trigger.
///
/// The fire-instance ID is unique per firing and immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    /// Unique identifier of this firing.
    pub fire_instance_id: FireInstanceId,
    /// The job that fired.
    pub job_key: JobKey,
    /// The trigger that fired.
    pub trigger_key: TriggerKey,
    /// When the firing was scheduled to happen.
    pub scheduled_time: DateTime<Utc>,
    /// When the firing actually started.
    pub fired_at: DateTime<Utc>,
    /// When the firing finished, if it has.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error message, if the handler failed.
    pub error_message: Option<String>,
    /// True if this firing was created by crash/error recovery.
    pub recovering: bool,
    /// True if this firing was skipped due to a concurrency conflict.
    pub vetoed: bool,
}

impl JobExecution {
    /// Creates an execution record for a firing starting now.
    #[must_use]
    pub fn start(
        job_key: JobKey,
        trigger_key: TriggerKey,
        scheduled_time: DateTime<Utc>,
        recovering: bool,
    ) -> Self {
        Self {
            fire_instance_id: FireInstanceId::new(),
            job_key,
            trigger_key,
            scheduled_time,
            fired_at: Utc::now(),
            finished_at: None,
            error_message: None,
            recovering,
            vetoed: false,
        }
    }

    /// Marks the firing as completed successfully.
    pub fn complete(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Marks the firing as failed with the handler's error message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.finished_at = Some(Utc::now());
        self.error_message = Some(message.into());
    }

    /// Marks the firing as vetoed by the concurrency policy.
    pub fn veto(&mut self) {
        self.vetoed = true;
        self.finished_at = Some(Utc::now());
    }

    /// Returns true if the firing is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.finished_at.is_none() && !self.vetoed
    }

    /// Returns true if the firing failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.error_message.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> JobExecution {
        let job = JobKey::new("TestJob");
        JobExecution::start(job.clone(), TriggerKey::from(&job), Utc::now(), false)
    }

    #[test]
    fn new_execution_is_running() {
        let exec = execution();
        assert!(exec.is_running());
        assert!(!exec.is_failed());
        assert!(!exec.recovering);
        assert!(!exec.vetoed);
    }

    #[test]
    fn complete_sets_finish_time() {
        let mut exec = execution();
        exec.complete();
        assert!(!exec.is_running());
        assert!(exec.finished_at.is_some());
        assert!(!exec.is_failed());
    }

    #[test]
    fn fail_records_message() {
        let mut exec = execution();
        exec.fail("connection timeout");
        assert!(exec.is_failed());
        assert_eq!(exec.error_message.as_deref(), Some("connection timeout"));
    }

    #[test]
    fn veto_is_not_running() {
        let mut exec = execution();
        exec.veto();
        assert!(exec.vetoed);
        assert!(!exec.is_running());
        assert!(!exec.is_failed());
    }

    #[test]
    fn fire_instance_ids_are_unique() {
        let a = execution();
        let b = execution();
        assert_ne!(a.fire_instance_id, b.fire_instance_id);
    }
}
