//! In-memory trigger store.
//!
//! Backs the scheduler crate's tests and embedded single-process use. The
//! single mutex stands in for the row-level locking a relational backend
//! provides: every trait method is one critical section, so CAS transitions
//! and batch acquisition are atomic with respect to concurrent callers.

use crate::error::StoreError;
use crate::execution::JobExecution;
use crate::store::TriggerStore;
use crate::trigger::{JobDetail, Trigger, TriggerState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use copper_metronome_core::{FireInstanceId, JobKey, TriggerKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, Trigger>,
    executions: Vec<JobExecution>,
    heartbeats: HashMap<String, DateTime<Utc>>,
}

/// An in-memory [`TriggerStore`].
#[derive(Clone, Default)]
pub struct MemoryTriggerStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTriggerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic mid-transition; propagating the
        // panic is the only sound option for an authoritative store.
        self.inner.lock().expect("trigger store mutex poisoned")
    }

    /// Returns the last recorded heartbeat for an instance.
    #[must_use]
    pub fn last_heartbeat(&self, instance: &str) -> Option<DateTime<Utc>> {
        self.lock().heartbeats.get(instance).copied()
    }
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn insert_job(&self, job: JobDetail) -> Result<(), StoreError> {
        self.lock().jobs.insert(job.key.clone(), job);
        Ok(())
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        Ok(self.lock().jobs.get(key).cloned())
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        Ok(self.lock().jobs.remove(key).is_some())
    }

    async fn insert_trigger(&self, trigger: Trigger) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.triggers.contains_key(&trigger.key) {
            return Err(StoreError::AlreadyExists {
                key: trigger.key,
            });
        }
        inner.triggers.insert(trigger.key.clone(), trigger);
        Ok(())
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        Ok(self.lock().triggers.get(key).cloned())
    }

    async fn update_trigger(&self, trigger: Trigger) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.triggers.contains_key(&trigger.key) {
            return Err(StoreError::NotFound {
                key: trigger.key,
            });
        }
        inner.triggers.insert(trigger.key.clone(), trigger);
        Ok(())
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        Ok(self.lock().triggers.remove(key).is_some())
    }

    async fn compare_and_set_state(
        &self,
        key: &TriggerKey,
        expected: TriggerState,
        new: TriggerState,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.triggers.get_mut(key) {
            Some(trigger) if trigger.state == expected => {
                trigger.transition(new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        batch: usize,
        owner: &str,
        _locked: bool,
    ) -> Result<Vec<Trigger>, StoreError> {
        // The store mutex already serializes concurrent acquisition passes,
        // so the explicit lock flag is a no-op here.
        let mut inner = self.lock();
        let mut due: Vec<TriggerKey> = inner
            .triggers
            .values()
            .filter(|t| t.is_due(now))
            .map(|t| t.key.clone())
            .collect();
        due.sort_by_key(|key| {
            inner
                .triggers
                .get(key)
                .and_then(|t| t.next_fire_time)
                .unwrap_or(now)
        });
        due.truncate(batch);

        // Acquisition claims the trigger for the acquiring instance, so
        // recovery scans on that instance will find it if it later fails.
        let mut acquired = Vec::with_capacity(due.len());
        for key in due {
            if let Some(trigger) = inner.triggers.get_mut(&key) {
                trigger.owner = owner.to_string();
                trigger.transition(TriggerState::Acquired);
                acquired.push(trigger.clone());
            }
        }
        Ok(acquired)
    }

    async fn list_jobs(&self) -> Result<Vec<(JobKey, Vec<Trigger>)>, StoreError> {
        let inner = self.lock();
        let mut jobs: Vec<(JobKey, Vec<Trigger>)> = inner
            .jobs
            .keys()
            .map(|job_key| {
                let triggers = inner
                    .triggers
                    .values()
                    .filter(|t| &t.job_key == job_key)
                    .cloned()
                    .collect();
                (job_key.clone(), triggers)
            })
            .collect();
        jobs.sort_by(|(a, _), (b, _)| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
        Ok(jobs)
    }

    async fn triggers_in_state(
        &self,
        state: TriggerState,
        owner: &str,
    ) -> Result<Vec<Trigger>, StoreError> {
        Ok(self
            .lock()
            .triggers
            .values()
            .filter(|t| t.state == state && t.owner == owner)
            .cloned()
            .collect())
    }

    async fn record_execution(&self, execution: JobExecution) -> Result<(), StoreError> {
        self.lock().executions.push(execution);
        Ok(())
    }

    async fn update_execution(&self, execution: JobExecution) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner
            .executions
            .iter_mut()
            .find(|e| e.fire_instance_id == execution.fire_instance_id)
        {
            Some(existing) => {
                *existing = execution;
                Ok(())
            }
            None => Err(StoreError::Backend {
                reason: format!("unknown fire instance {}", execution.fire_instance_id),
            }),
        }
    }

    async fn get_execution(
        &self,
        id: FireInstanceId,
    ) -> Result<Option<JobExecution>, StoreError> {
        Ok(self
            .lock()
            .executions
            .iter()
            .find(|e| e.fire_instance_id == id)
            .cloned())
    }

    async fn executions_for_job(&self, key: &JobKey) -> Result<Vec<JobExecution>, StoreError> {
        let mut executions: Vec<JobExecution> = self
            .lock()
            .executions
            .iter()
            .filter(|e| &e.job_key == key)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
        Ok(executions)
    }

    async fn has_executing(&self, key: &JobKey) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .executions
            .iter()
            .any(|e| &e.job_key == key && e.is_running()))
    }

    async fn purge_executions(&self, key: &JobKey) -> Result<u32, StoreError> {
        let mut inner = self.lock();
        let before = inner.executions.len();
        inner.executions.retain(|e| &e.job_key != key);
        Ok((before - inner.executions.len()) as u32)
    }

    async fn record_heartbeat(&self, instance: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.lock().heartbeats.insert(instance.to_string(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "test-instance";

    fn waiting_trigger(name: &str, due_in_secs: i64) -> Trigger {
        Trigger::new(
            TriggerKey::new(name),
            JobKey::new(name),
            "0 0 2 * * *",
            Some(Utc::now() + chrono::Duration::seconds(due_in_secs)),
            OWNER,
        )
    }

    #[tokio::test]
    async fn insert_duplicate_trigger_fails_and_preserves_original() {
        let store = MemoryTriggerStore::new();
        let original = waiting_trigger("A", -1);
        store.insert_trigger(original.clone()).await.unwrap();

        let mut duplicate = waiting_trigger("A", -1);
        duplicate.cron_expression = Some("0 0 5 * * *".to_string());
        let err = store.insert_trigger(duplicate).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let stored = store.get_trigger(&original.key).await.unwrap().unwrap();
        assert_eq!(stored.cron_expression, original.cron_expression);
    }

    #[tokio::test]
    async fn cas_only_transitions_expected_state() {
        let store = MemoryTriggerStore::new();
        let trigger = waiting_trigger("A", -1);
        let key = trigger.key.clone();
        store.insert_trigger(trigger).await.unwrap();

        assert!(
            store
                .compare_and_set_state(&key, TriggerState::Waiting, TriggerState::Acquired)
                .await
                .unwrap()
        );
        // Second CAS from Waiting must fail; the state moved on.
        assert!(
            !store
                .compare_and_set_state(&key, TriggerState::Waiting, TriggerState::Acquired)
                .await
                .unwrap()
        );

        let stored = store.get_trigger(&key).await.unwrap().unwrap();
        assert_eq!(stored.state, TriggerState::Acquired);
    }

    #[tokio::test]
    async fn acquire_due_respects_batch_and_claims_ownership() {
        let store = MemoryTriggerStore::new();
        store.insert_trigger(waiting_trigger("A", -10)).await.unwrap();
        store.insert_trigger(waiting_trigger("B", -5)).await.unwrap();
        store.insert_trigger(waiting_trigger("C", 3600)).await.unwrap();

        let mut foreign = waiting_trigger("D", -8);
        foreign.owner = "other-instance".to_string();
        store.insert_trigger(foreign.clone()).await.unwrap();

        let acquired = store.acquire_due(Utc::now(), 1, OWNER, false).await.unwrap();
        assert_eq!(acquired.len(), 1);
        // Earliest fire time first
        assert_eq!(acquired[0].key.name, "A");
        assert_eq!(acquired[0].state, TriggerState::Acquired);

        // A second pass claims the remaining due triggers, stamping this
        // instance as owner regardless of who scheduled them.
        let acquired = store.acquire_due(Utc::now(), 10, OWNER, true).await.unwrap();
        assert_eq!(acquired.len(), 2);
        assert_eq!(acquired[0].key.name, "D");
        assert_eq!(acquired[1].key.name, "B");
        assert!(acquired.iter().all(|t| t.owner == OWNER));

        let claimed = store.get_trigger(&foreign.key).await.unwrap().unwrap();
        assert_eq!(claimed.owner, OWNER);
    }

    #[tokio::test]
    async fn concurrent_acquisition_never_double_claims() {
        let store = MemoryTriggerStore::new();
        store.insert_trigger(waiting_trigger("A", -1)).await.unwrap();

        let now = Utc::now();
        let a = store.acquire_due(now, 5, OWNER, true);
        let b = store.acquire_due(now, 5, OWNER, true);
        let (a, b) = tokio::join!(a, b);

        let total = a.unwrap().len() + b.unwrap().len();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn list_jobs_includes_triggerless_jobs() {
        let store = MemoryTriggerStore::new();
        store
            .insert_job(JobDetail::new(JobKey::new("NoTrigger")))
            .await
            .unwrap();
        store
            .insert_job(JobDetail::new(JobKey::new("WithTrigger")))
            .await
            .unwrap();
        store
            .insert_trigger(waiting_trigger("WithTrigger", 60))
            .await
            .unwrap();

        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        let (no_trigger, triggers) = jobs
            .iter()
            .find(|(k, _)| k.name == "NoTrigger")
            .unwrap();
        assert_eq!(no_trigger.group, "DEFAULT");
        assert!(triggers.is_empty());

        let (_, triggers) = jobs
            .iter()
            .find(|(k, _)| k.name == "WithTrigger")
            .unwrap();
        assert_eq!(triggers.len(), 1);
    }

    #[tokio::test]
    async fn has_executing_tracks_running_firings() {
        let store = MemoryTriggerStore::new();
        let job = JobKey::new("SignDocuments");
        let mut exec =
            JobExecution::start(job.clone(), TriggerKey::from(&job), Utc::now(), false);
        store.record_execution(exec.clone()).await.unwrap();
        assert!(store.has_executing(&job).await.unwrap());

        exec.complete();
        store.update_execution(exec).await.unwrap();
        assert!(!store.has_executing(&job).await.unwrap());
    }

    #[tokio::test]
    async fn vetoed_firing_is_not_executing() {
        let store = MemoryTriggerStore::new();
        let job = JobKey::new("SignDocuments");
        let mut exec =
            JobExecution::start(job.clone(), TriggerKey::from(&job), Utc::now(), false);
        exec.veto();
        store.record_execution(exec).await.unwrap();
        assert!(!store.has_executing(&job).await.unwrap());
    }

    #[tokio::test]
    async fn purge_executions_clears_history() {
        let store = MemoryTriggerStore::new();
        let job = JobKey::new("Stuck");
        for _ in 0..3 {
            store
                .record_execution(JobExecution::start(
                    job.clone(),
                    TriggerKey::from(&job),
                    Utc::now(),
                    false,
                ))
                .await
                .unwrap();
        }

        let purged = store.purge_executions(&job).await.unwrap();
        assert_eq!(purged, 3);
        assert!(store.executions_for_job(&job).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_is_recorded() {
        let store = MemoryTriggerStore::new();
        let at = Utc::now();
        store.record_heartbeat(OWNER, at).await.unwrap();
        assert_eq!(store.last_heartbeat(OWNER), Some(at));
    }
}
