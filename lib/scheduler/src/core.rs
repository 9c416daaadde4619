//! Scheduling operations: admit, withdraw, and repair cron-driven jobs.

use chrono::Utc;
use copper_metronome_core::{JobKey, TriggerKey};
use copper_metronome_store::{JobDetail, StoreError, Trigger, TriggerState, TriggerStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::handler::JobRegistry;
use crate::schedule::CronSchedule;

/// Outcome of a scheduling operation, suitable for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct OpStatus {
    /// Which operation ran.
    pub operation: Operation,
    /// The job the operation touched.
    pub job_key: JobKey,
    /// Trigger state after the operation, if a trigger exists.
    pub trigger_state: Option<TriggerState>,
    /// When the operation completed.
    pub at: chrono::DateTime<Utc>,
    /// True if the operation modified state; false for no-ops.
    pub changed: bool,
}

/// Scheduling operations reported in [`OpStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Schedule,
    Unschedule,
    ResetFromError,
    Pause,
    Resume,
}

/// Front door for managing cron-driven jobs against a trigger store.
pub struct Scheduler<S> {
    store: Arc<S>,
    registry: Arc<JobRegistry>,
    config: Arc<SchedulerConfig>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: TriggerStore> Scheduler<S> {
    #[must_use]
    pub fn new(store: Arc<S>, registry: Arc<JobRegistry>, config: Arc<SchedulerConfig>) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Admits a job with a cron trigger.
    ///
    /// The cron expression is resolved from `cron_expression` if given,
    /// otherwise from configuration by job name. The trigger starts in
    /// Waiting with its first fire time computed from now.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyScheduled`] if a trigger for the job
    /// already exists, [`SchedulerError::MissingCronExpression`] if no
    /// expression is resolvable, or [`SchedulerError::InvalidCronExpression`]
    /// if the expression does not parse.
    pub async fn schedule(
        &self,
        job_key: &JobKey,
        cron_expression: Option<&str>,
    ) -> Result<OpStatus, SchedulerError> {
        let trigger_key = TriggerKey::from(job_key);
        if self.store.get_trigger(&trigger_key).await?.is_some() {
            return Err(SchedulerError::AlreadyScheduled {
                key: trigger_key,
            });
        }

        let expression = cron_expression
            .or_else(|| self.config.cron_for(&job_key.name))
            .ok_or_else(|| SchedulerError::MissingCronExpression {
                job: job_key.name.clone(),
            })?
            .to_owned();

        let schedule = CronSchedule::new(&expression);
        schedule.validate()?;
        let now = Utc::now();
        let next = schedule.next_after(now);

        let registration = self.registry.get(&job_key.name);
        let mut detail = JobDetail::new(job_key.clone());
        if let Some(registration) = registration {
            if registration.disallow_concurrent {
                detail = detail.non_concurrent();
            }
            if let Some(description) = &registration.description {
                detail = detail.with_description(description.clone());
            }
        }
        self.store.insert_job(detail).await?;

        let trigger = Trigger::new(
            trigger_key,
            job_key.clone(),
            expression,
            next,
            self.config.instance_name.clone(),
        );
        match self.store.insert_trigger(trigger).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { key }) => {
                // Lost a race with a concurrent schedule call.
                return Err(SchedulerError::AlreadyScheduled { key });
            }
            Err(e) => return Err(e.into()),
        }

        info!(job = %job_key, next_fire_time = ?next, "scheduled job");
        Ok(OpStatus {
            operation: Operation::Schedule,
            job_key: job_key.clone(),
            trigger_state: Some(TriggerState::Waiting),
            at: Utc::now(),
            changed: true,
        })
    }

    /// Withdraws a job's cron trigger. Idempotent; the job detail and its
    /// execution history are left in place.
    pub async fn unschedule(&self, job_key: &JobKey) -> Result<OpStatus, SchedulerError> {
        let trigger_key = TriggerKey::from(job_key);
        let removed = self.store.remove_trigger(&trigger_key).await?;
        if removed {
            info!(job = %job_key, "unscheduled job");
        }
        Ok(OpStatus {
            operation: Operation::Unschedule,
            job_key: job_key.clone(),
            trigger_state: None,
            at: Utc::now(),
            changed: removed,
        })
    }

    /// Re-admits a trigger stuck in Error, recomputing its next fire time.
    ///
    /// A no-op when the trigger is in any other state.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TriggerNotFound`] if the job has no trigger.
    pub async fn reset_from_error(&self, job_key: &JobKey) -> Result<OpStatus, SchedulerError> {
        let trigger_key = TriggerKey::from(job_key);
        let Some(mut trigger) = self.store.get_trigger(&trigger_key).await? else {
            return Err(SchedulerError::TriggerNotFound { key: trigger_key });
        };

        if trigger.state != TriggerState::Error {
            return Ok(OpStatus {
                operation: Operation::ResetFromError,
                job_key: job_key.clone(),
                trigger_state: Some(trigger.state),
                at: Utc::now(),
                changed: false,
            });
        }

        trigger.next_fire_time = crate::schedule::next_fire_time(&trigger, Utc::now());
        trigger.transition(TriggerState::Waiting);
        self.store.update_trigger(trigger).await?;
        info!(job = %job_key, "reset job trigger from error state");
        Ok(OpStatus {
            operation: Operation::ResetFromError,
            job_key: job_key.clone(),
            trigger_state: Some(TriggerState::Waiting),
            at: Utc::now(),
            changed: true,
        })
    }

    /// Pauses a Waiting trigger. A no-op in any other state.
    pub async fn pause(&self, job_key: &JobKey) -> Result<OpStatus, SchedulerError> {
        let trigger_key = TriggerKey::from(job_key);
        let changed = self
            .store
            .compare_and_set_state(&trigger_key, TriggerState::Waiting, TriggerState::Paused)
            .await?;
        Ok(OpStatus {
            operation: Operation::Pause,
            job_key: job_key.clone(),
            trigger_state: self.current_state(&trigger_key).await?,
            at: Utc::now(),
            changed,
        })
    }

    /// Resumes a Paused trigger, recomputing its next fire time so missed
    /// firings while paused are not replayed.
    pub async fn resume(&self, job_key: &JobKey) -> Result<OpStatus, SchedulerError> {
        let trigger_key = TriggerKey::from(job_key);
        let Some(mut trigger) = self.store.get_trigger(&trigger_key).await? else {
            return Err(SchedulerError::TriggerNotFound { key: trigger_key });
        };

        let changed = trigger.state == TriggerState::Paused;
        if changed {
            trigger.next_fire_time = crate::schedule::next_fire_time(&trigger, Utc::now());
            trigger.transition(TriggerState::Waiting);
            self.store.update_trigger(trigger.clone()).await?;
        }
        Ok(OpStatus {
            operation: Operation::Resume,
            job_key: job_key.clone(),
            trigger_state: Some(trigger.state),
            at: Utc::now(),
            changed,
        })
    }

    /// Snapshot of all known jobs and their triggers.
    pub async fn list_jobs(
        &self,
    ) -> Result<Vec<(JobKey, Vec<Trigger>)>, SchedulerError> {
        Ok(self.store.list_jobs().await?)
    }

    /// Schedules every registered job that has a configured cron expression
    /// and no trigger yet. Called at startup; already-scheduled jobs are
    /// left untouched.
    pub async fn sync_configured_jobs(&self) -> Result<(), SchedulerError> {
        let names: Vec<String> = self
            .registry
            .job_names()
            .filter(|name| self.config.cron_for(name).is_some())
            .map(str::to_owned)
            .collect();
        for name in names {
            let job_key = JobKey::new(&name);
            match self.schedule(&job_key, None).await {
                Ok(_) => {}
                Err(SchedulerError::AlreadyScheduled { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn current_state(
        &self,
        trigger_key: &TriggerKey,
    ) -> Result<Option<TriggerState>, SchedulerError> {
        Ok(self
            .store
            .get_trigger(trigger_key)
            .await?
            .map(|t| t.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{JobRegistration, MockHandler};
    use copper_metronome_store::MemoryTriggerStore;

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register(
            "Heartbeat",
            JobRegistration::new(Arc::new(MockHandler::succeeding())),
        );
        registry.register(
            "Reconcile",
            JobRegistration::new(Arc::new(MockHandler::succeeding())).non_concurrent(),
        );
        Arc::new(registry)
    }

    fn scheduler_with(config: SchedulerConfig) -> Scheduler<MemoryTriggerStore> {
        Scheduler::new(
            Arc::new(MemoryTriggerStore::new()),
            registry(),
            Arc::new(config),
        )
    }

    fn scheduler() -> Scheduler<MemoryTriggerStore> {
        scheduler_with(SchedulerConfig::default())
    }

    #[tokio::test]
    async fn schedule_creates_waiting_trigger() {
        let scheduler = scheduler();
        let job_key = JobKey::new("Heartbeat");

        let status = scheduler
            .schedule(&job_key, Some("0 * * * * *"))
            .await
            .expect("schedule");
        assert!(status.changed);
        assert_eq!(status.trigger_state, Some(TriggerState::Waiting));

        let trigger = scheduler
            .store
            .get_trigger(&TriggerKey::from(&job_key))
            .await
            .unwrap()
            .expect("trigger exists");
        assert!(trigger.next_fire_time.is_some());
        assert_eq!(trigger.cron_expression.as_deref(), Some("0 * * * * *"));
    }

    #[tokio::test]
    async fn schedule_twice_is_rejected() {
        let scheduler = scheduler();
        let job_key = JobKey::new("Heartbeat");
        scheduler
            .schedule(&job_key, Some("0 * * * * *"))
            .await
            .expect("first schedule");

        let result = scheduler.schedule(&job_key, Some("0 * * * * *")).await;
        assert!(matches!(
            result,
            Err(SchedulerError::AlreadyScheduled { .. })
        ));
    }

    #[tokio::test]
    async fn schedule_resolves_expression_from_config() {
        let mut config = SchedulerConfig::default();
        config
            .cron_expressions
            .insert("Heartbeat".into(), "0 0 * * * *".into());
        let scheduler = scheduler_with(config);
        let job_key = JobKey::new("Heartbeat");

        scheduler.schedule(&job_key, None).await.expect("schedule");
        let trigger = scheduler
            .store
            .get_trigger(&TriggerKey::from(&job_key))
            .await
            .unwrap()
            .expect("trigger exists");
        assert_eq!(trigger.cron_expression.as_deref(), Some("0 0 * * * *"));
    }

    #[tokio::test]
    async fn schedule_without_expression_fails() {
        let scheduler = scheduler();
        let result = scheduler.schedule(&JobKey::new("Heartbeat"), None).await;
        assert!(matches!(
            result,
            Err(SchedulerError::MissingCronExpression { .. })
        ));
    }

    #[tokio::test]
    async fn schedule_rejects_bad_expression() {
        let scheduler = scheduler();
        let result = scheduler
            .schedule(&JobKey::new("Heartbeat"), Some("not a cron"))
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidCronExpression { .. })
        ));
    }

    #[tokio::test]
    async fn schedule_marks_non_concurrent_jobs() {
        let scheduler = scheduler();
        let job_key = JobKey::new("Reconcile");
        scheduler
            .schedule(&job_key, Some("0 * * * * *"))
            .await
            .expect("schedule");

        let detail = scheduler
            .store
            .get_job(&job_key)
            .await
            .unwrap()
            .expect("job detail");
        assert!(detail.disallow_concurrent);
    }

    #[tokio::test]
    async fn unschedule_is_idempotent() {
        let scheduler = scheduler();
        let job_key = JobKey::new("Heartbeat");
        scheduler
            .schedule(&job_key, Some("0 * * * * *"))
            .await
            .expect("schedule");

        let first = scheduler.unschedule(&job_key).await.expect("unschedule");
        assert!(first.changed);
        let second = scheduler.unschedule(&job_key).await.expect("unschedule");
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn reset_from_error_readmits_trigger() {
        let scheduler = scheduler();
        let job_key = JobKey::new("Heartbeat");
        scheduler
            .schedule(&job_key, Some("0 * * * * *"))
            .await
            .expect("schedule");
        let trigger_key = TriggerKey::from(&job_key);
        assert!(scheduler
            .store
            .compare_and_set_state(&trigger_key, TriggerState::Waiting, TriggerState::Error)
            .await
            .unwrap());

        let status = scheduler.reset_from_error(&job_key).await.expect("reset");
        assert!(status.changed);
        assert_eq!(status.trigger_state, Some(TriggerState::Waiting));
    }

    #[tokio::test]
    async fn reset_from_error_is_a_noop_outside_error_state() {
        let scheduler = scheduler();
        let job_key = JobKey::new("Heartbeat");
        scheduler
            .schedule(&job_key, Some("0 * * * * *"))
            .await
            .expect("schedule");

        let status = scheduler.reset_from_error(&job_key).await.expect("reset");
        assert!(!status.changed);
        assert_eq!(status.trigger_state, Some(TriggerState::Waiting));
    }

    #[tokio::test]
    async fn reset_from_error_requires_a_trigger() {
        let scheduler = scheduler();
        let result = scheduler.reset_from_error(&JobKey::new("Heartbeat")).await;
        assert!(matches!(result, Err(SchedulerError::TriggerNotFound { .. })));
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let scheduler = scheduler();
        let job_key = JobKey::new("Heartbeat");
        scheduler
            .schedule(&job_key, Some("0 * * * * *"))
            .await
            .expect("schedule");

        let paused = scheduler.pause(&job_key).await.expect("pause");
        assert!(paused.changed);
        assert_eq!(paused.trigger_state, Some(TriggerState::Paused));

        // Pausing again is a no-op.
        let paused_again = scheduler.pause(&job_key).await.expect("pause");
        assert!(!paused_again.changed);

        let resumed = scheduler.resume(&job_key).await.expect("resume");
        assert!(resumed.changed);
        assert_eq!(resumed.trigger_state, Some(TriggerState::Waiting));
    }

    #[tokio::test]
    async fn sync_configured_jobs_schedules_once() {
        let mut config = SchedulerConfig::default();
        config
            .cron_expressions
            .insert("Heartbeat".into(), "0 * * * * *".into());
        let scheduler = scheduler_with(config);

        scheduler.sync_configured_jobs().await.expect("sync");
        scheduler.sync_configured_jobs().await.expect("second sync");

        let jobs = scheduler.list_jobs().await.expect("list");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].1.len(), 1);
    }
}
