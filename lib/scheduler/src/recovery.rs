//! Background recovery: re-admits errored triggers and unwedges blocked
//! jobs that have gone too long without firing.

use chrono::{DateTime, Utc};
use copper_metronome_store::{Trigger, TriggerState, TriggerStore};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::schedule::next_fire_time;

/// Periodically repairs triggers stuck in Error or Blocked. Both loops are
/// scoped to triggers this instance owns.
pub struct RecoveryMonitor<S> {
    store: Arc<S>,
    config: Arc<SchedulerConfig>,
}

impl<S: TriggerStore + 'static> RecoveryMonitor<S> {
    #[must_use]
    pub fn new(store: Arc<S>, config: Arc<SchedulerConfig>) -> Self {
        Self { store, config }
    }

    /// Runs the error-recovery loop until shutdown is signalled.
    pub async fn run_error_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.job_recovery_delay());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.recover_errored().await {
                        warn!(error = %e, "error recovery pass failed");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Runs the blocked-recovery loop until shutdown is signalled. Does
    /// nothing when no jobs are on the blocked-recovery allow-list.
    pub async fn run_blocked_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let blocked = &self.config.blocked_recovery;
        if blocked.jobs.is_empty() {
            return;
        }
        let mut interval = tokio::time::interval(blocked.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.recover_blocked().await {
                        warn!(error = %e, "blocked recovery pass failed");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Re-admits every trigger owned by this instance that is parked in
    /// Error, marking the next firing as a recovery firing. Also records
    /// a liveness heartbeat for the instance.
    pub async fn recover_errored(&self) -> Result<u32, SchedulerError> {
        let now = Utc::now();
        self.store
            .record_heartbeat(&self.config.instance_name, now)
            .await?;

        let errored = self
            .store
            .triggers_in_state(TriggerState::Error, &self.config.instance_name)
            .await?;
        let mut recovered = 0;
        for trigger in errored {
            if self.readmit(trigger, now).await? {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Re-admits one errored trigger. The Error to Waiting transition goes
    /// through the CAS so a concurrent operator reset wins the race; the
    /// scan's copy is only written back once this pass holds the trigger.
    async fn readmit(
        &self,
        mut trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let admitted = self
            .store
            .compare_and_set_state(&trigger.key, TriggerState::Error, TriggerState::Waiting)
            .await?;
        if !admitted {
            return Ok(false);
        }
        trigger.recovering = true;
        trigger.next_fire_time = next_fire_time(&trigger, now);
        trigger.transition(TriggerState::Waiting);
        info!(
            job = %trigger.job_key,
            trigger = %trigger.key,
            "recovering errored trigger",
        );
        self.store.update_trigger(trigger).await?;
        Ok(true)
    }

    /// Recreates blocked triggers owned by this instance whose job is on
    /// the recovery allow-list and has not fired within the configured
    /// maximum delay. Both cron triggers and enqueued one-shots qualify.
    ///
    /// Recreation is deliberately blunt: the trigger is removed along with
    /// the job's execution records that caused the veto, then inserted
    /// fresh with the same schedule and payload.
    pub async fn recover_blocked(&self) -> Result<u32, SchedulerError> {
        let blocked = &self.config.blocked_recovery;
        if blocked.jobs.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let stuck = self
            .store
            .triggers_in_state(TriggerState::Blocked, &self.config.instance_name)
            .await?;
        let mut recovered = 0;
        for trigger in stuck {
            if !blocked.jobs.contains(&trigger.job_key.name) {
                continue;
            }
            let last_fired = trigger.previous_fire_time.unwrap_or(trigger.created_at);
            if now - last_fired <= blocked.max_fire_delay() {
                continue;
            }

            warn!(
                job = %trigger.job_key,
                trigger = %trigger.key,
                last_fired = %last_fired,
                "recreating blocked trigger",
            );
            self.store.remove_trigger(&trigger.key).await?;
            let purged = self.store.purge_executions(&trigger.job_key).await?;
            info!(job = %trigger.job_key, purged, "purged stale execution records");

            let fresh = match &trigger.cron_expression {
                Some(expression) => Trigger::new(
                    trigger.key.clone(),
                    trigger.job_key.clone(),
                    expression.clone(),
                    next_fire_time(&trigger, now),
                    self.config.instance_name.clone(),
                ),
                None => Trigger::one_shot(
                    trigger.key.clone(),
                    trigger.job_key.clone(),
                    trigger.payload.clone(),
                    self.config.instance_name.clone(),
                ),
            };
            self.store.insert_trigger(fresh).await?;
            recovered += 1;
        }
        Ok(recovered)
    }
}
