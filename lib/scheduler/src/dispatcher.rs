//! Acquisition loop: claims due triggers and hands them to the runner.

use chrono::Utc;
use copper_metronome_core::TriggerKey;
use copper_metronome_store::{JobExecution, MisfirePolicy, Trigger, TriggerState, TriggerStore};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::handler::{CancelToken, HandlerError, JobRegistry};
use crate::runner::JobRunner;
use crate::schedule::next_fire_time;

/// How far past its fire time a trigger may be acquired before the firing
/// counts as a misfire and the trigger's misfire policy applies.
const MISFIRE_THRESHOLD_MS: i64 = 60_000;

/// Polls the store for due triggers and dispatches them to handlers,
/// bounded by the configured concurrency limit.
pub struct Dispatcher<S> {
    store: Arc<S>,
    registry: Arc<JobRegistry>,
    config: Arc<SchedulerConfig>,
    runner: JobRunner<S>,
    permits: Arc<Semaphore>,
}

impl<S: TriggerStore + 'static> Dispatcher<S> {
    #[must_use]
    pub fn new(store: Arc<S>, registry: Arc<JobRegistry>, config: Arc<SchedulerConfig>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            runner: JobRunner::new(Arc::clone(&store)),
            store,
            registry,
            config,
            permits,
        }
    }

    /// Runs the acquisition loop until shutdown is signalled.
    ///
    /// Store errors during a tick are logged and the loop continues with
    /// the next interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(CancelToken::new(shutdown.clone())).await {
                        warn!(error = %e, "trigger acquisition tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("dispatcher shutting down");
                    return;
                }
            }
        }
    }

    /// Acquires and dispatches one batch of due triggers.
    ///
    /// A dispatch failure releases that trigger back to Waiting and the
    /// rest of the batch still runs; nothing is left stranded in Acquired.
    pub async fn tick(&self, cancel: CancelToken) -> Result<(), SchedulerError> {
        let acquired = self
            .store
            .acquire_due(
                Utc::now(),
                self.config.batch_size,
                &self.config.instance_name,
                self.config.acquisition_locked(),
            )
            .await?;

        for trigger in acquired {
            let key = trigger.key.clone();
            if let Err(e) = self.dispatch(trigger, cancel.clone()).await {
                warn!(trigger = %key, error = %e, "dispatch failed");
                self.release(&key).await;
            }
        }
        Ok(())
    }

    /// Returns a trigger claimed by a failed dispatch to Waiting so a later
    /// tick can retry it. Best effort; a CAS miss means the trigger already
    /// moved on.
    async fn release(&self, key: &TriggerKey) {
        for held in [TriggerState::Acquired, TriggerState::Executing] {
            match self
                .store
                .compare_and_set_state(key, held, TriggerState::Waiting)
                .await
            {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    warn!(trigger = %key, error = %e, "failed to release trigger");
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, trigger: Trigger, cancel: CancelToken) -> Result<(), SchedulerError> {
        if self.handle_misfire(&trigger).await? {
            return Ok(());
        }

        let Some(registration) = self.registry.get(&trigger.job_key.name) else {
            self.reject(
                &trigger,
                TriggerState::Error,
                HandlerError::MissingHandler {
                    job: trigger.job_key.name.clone(),
                },
            )
            .await?;
            return Ok(());
        };

        if registration.disallow_concurrent && self.store.has_executing(&trigger.job_key).await? {
            warn!(
                job = %trigger.job_key,
                trigger = %trigger.key,
                "vetoed concurrent execution",
            );
            let mut execution = JobExecution::start(
                trigger.job_key.clone(),
                trigger.key.clone(),
                trigger.next_fire_time.unwrap_or_else(Utc::now),
                trigger.recovering,
            );
            execution.veto();
            self.store.record_execution(execution).await?;
            self.store
                .compare_and_set_state(&trigger.key, TriggerState::Acquired, TriggerState::Blocked)
                .await?;
            return Ok(());
        }

        let claimed = self
            .store
            .compare_and_set_state(&trigger.key, TriggerState::Acquired, TriggerState::Executing)
            .await?;
        if !claimed {
            // Someone else moved the trigger since acquisition; skip it.
            return Ok(());
        }

        let execution = JobExecution::start(
            trigger.job_key.clone(),
            trigger.key.clone(),
            trigger.next_fire_time.unwrap_or_else(Utc::now),
            trigger.recovering,
        );
        self.store.record_execution(execution.clone()).await?;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| SchedulerError::Serialization {
                reason: format!("dispatcher semaphore closed: {e}"),
            })?;
        let runner = self.runner.clone();
        let handler = Arc::clone(&registration.handler);
        tokio::spawn(async move {
            let job_key = trigger.job_key.clone();
            if let Err(e) = runner.run(trigger, handler, execution, cancel).await {
                warn!(job = %job_key, error = %e, "failed to settle job execution");
            }
            drop(permit);
        });
        Ok(())
    }

    /// Applies the misfire policy to a trigger acquired well past its fire
    /// time. Returns true when the firing was skipped.
    async fn handle_misfire(&self, trigger: &Trigger) -> Result<bool, SchedulerError> {
        let Some(scheduled) = trigger.next_fire_time else {
            return Ok(false);
        };
        let overdue = Utc::now() - scheduled;
        if overdue <= chrono::Duration::milliseconds(MISFIRE_THRESHOLD_MS) {
            return Ok(false);
        }

        match trigger.misfire_policy {
            // Smart handling for a cron trigger is one immediate firing,
            // the same as FireNow.
            MisfirePolicy::Smart | MisfirePolicy::FireNow => Ok(false),
            MisfirePolicy::DoNothing => {
                warn!(
                    job = %trigger.job_key,
                    trigger = %trigger.key,
                    overdue_ms = overdue.num_milliseconds(),
                    "skipping misfired trigger",
                );
                let mut skipped = trigger.clone();
                skipped.next_fire_time = next_fire_time(trigger, Utc::now());
                skipped.transition(TriggerState::Waiting);
                self.store.update_trigger(skipped).await?;
                Ok(true)
            }
        }
    }

    /// Records a failed execution for a trigger that never ran and parks
    /// the trigger in `state`.
    async fn reject(
        &self,
        trigger: &Trigger,
        state: TriggerState,
        error: HandlerError,
    ) -> Result<(), SchedulerError> {
        warn!(job = %trigger.job_key, error = %error, "rejected acquired trigger");
        let mut execution = JobExecution::start(
            trigger.job_key.clone(),
            trigger.key.clone(),
            trigger.next_fire_time.unwrap_or_else(Utc::now),
            trigger.recovering,
        );
        execution.fail(error.to_string());
        self.store.record_execution(execution).await?;
        self.store
            .compare_and_set_state(&trigger.key, TriggerState::Acquired, state)
            .await?;
        Ok(())
    }
}
