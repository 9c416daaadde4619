//! The trigger storage trait.

use crate::error::StoreError;
use crate::execution::JobExecution;
use crate::trigger::{JobDetail, Trigger, TriggerState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use copper_metronome_core::{FireInstanceId, JobKey, TriggerKey};

/// Trait for durable trigger and execution storage.
///
/// The store is shared and authoritative: multiple dispatcher threads (and,
/// in principle, multiple processes over a shared database) coordinate only
/// through it. Implementations must make [`compare_and_set_state`] and
/// [`acquire_due`] atomic with respect to concurrent callers; that row-level
/// guarding is the system's sole concurrency-control primitive.
///
/// [`compare_and_set_state`]: TriggerStore::compare_and_set_state
/// [`acquire_due`]: TriggerStore::acquire_due
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Inserts or replaces a job's durable details.
    async fn insert_job(&self, job: JobDetail) -> Result<(), StoreError>;

    /// Gets a job's details.
    async fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError>;

    /// Removes a job's details. Returns whether anything was removed.
    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError>;

    /// Inserts a trigger.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if a trigger with the same
    /// key already exists; the existing trigger is left unmodified.
    async fn insert_trigger(&self, trigger: Trigger) -> Result<(), StoreError>;

    /// Gets a trigger by key.
    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError>;

    /// Replaces a trigger's stored row.
    async fn update_trigger(&self, trigger: Trigger) -> Result<(), StoreError>;

    /// Removes a trigger. Returns whether anything was removed.
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError>;

    /// Atomically transitions a trigger from `expected` to `new`.
    ///
    /// Returns false (without modifying anything) when the trigger is absent
    /// or no longer in the expected state.
    async fn compare_and_set_state(
        &self,
        key: &TriggerKey,
        expected: TriggerState,
        new: TriggerState,
    ) -> Result<bool, StoreError>;

    /// Acquires up to `batch` due triggers for `owner`, transitioning each
    /// from Waiting to Acquired.
    ///
    /// With `locked` set (required for batch > 1) the acquisition runs under
    /// the store-level trigger-access lock, so two concurrent dispatcher
    /// passes can never claim the same trigger.
    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        batch: usize,
        owner: &str,
        locked: bool,
    ) -> Result<Vec<Trigger>, StoreError>;

    /// Lists all registered jobs joined with their triggers.
    ///
    /// A job with no trigger still appears, with an empty trigger list.
    async fn list_jobs(&self) -> Result<Vec<(JobKey, Vec<Trigger>)>, StoreError>;

    /// Lists triggers in `state` owned by `owner`.
    async fn triggers_in_state(
        &self,
        state: TriggerState,
        owner: &str,
    ) -> Result<Vec<Trigger>, StoreError>;

    /// Records a new firing instance.
    async fn record_execution(&self, execution: JobExecution) -> Result<(), StoreError>;

    /// Updates an existing firing instance (completion, failure, veto).
    async fn update_execution(&self, execution: JobExecution) -> Result<(), StoreError>;

    /// Gets one firing instance by ID.
    async fn get_execution(
        &self,
        id: FireInstanceId,
    ) -> Result<Option<JobExecution>, StoreError>;

    /// Lists firing history for a job, newest first.
    async fn executions_for_job(&self, key: &JobKey) -> Result<Vec<JobExecution>, StoreError>;

    /// Returns true if any non-vetoed firing of the job is still running.
    async fn has_executing(&self, key: &JobKey) -> Result<bool, StoreError>;

    /// Deletes all firing history for a job.
    ///
    /// Used by blocked-recovery when a trigger's identity is recreated; the
    /// stuck firing's bookkeeping is deliberately abandoned.
    async fn purge_executions(&self, key: &JobKey) -> Result<u32, StoreError>;

    /// Records a scheduler instance checkin in the scheduler-state table.
    async fn record_heartbeat(&self, instance: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}
