//! Executes a single firing and settles the trigger afterward.

use chrono::Utc;
use copper_metronome_store::{JobExecution, Trigger, TriggerState, TriggerStore};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::handler::{CancelToken, JobContext, JobHandler};
use crate::schedule::next_fire_time;

/// Runs one firing end to end: invoke the handler, record the outcome on
/// the execution record, and move the trigger to its next state.
pub struct JobRunner<S> {
    store: Arc<S>,
}

impl<S> Clone for JobRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TriggerStore + 'static> JobRunner<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Runs the handler for one firing of `trigger`.
    ///
    /// On success the trigger goes Executing then Complete, is rescheduled
    /// to its next fire time (or removed when one-shot), and returns to
    /// Waiting. On failure the execution record carries the error message
    /// and the trigger parks in Error; if the handler opts into re-fire,
    /// a delayed task moves Error back to Waiting.
    pub async fn run(
        &self,
        mut trigger: Trigger,
        handler: Arc<dyn JobHandler>,
        mut execution: JobExecution,
        cancel: CancelToken,
    ) -> Result<(), SchedulerError> {
        let ctx = JobContext {
            job_key: trigger.job_key.clone(),
            fire_instance_id: execution.fire_instance_id.clone(),
            scheduled_time: execution.scheduled_time,
            payload: trigger.payload.clone(),
            recovering: execution.recovering,
            cancel,
        };
        info!(
            job = %trigger.job_key,
            fire_instance = %execution.fire_instance_id,
            recovering = execution.recovering,
            "executing job",
        );

        match handler.execute(ctx).await {
            Ok(()) => {
                execution.complete();
                self.store.update_execution(execution).await?;

                let fired_at = trigger.next_fire_time.unwrap_or_else(Utc::now);
                self.store
                    .compare_and_set_state(
                        &trigger.key,
                        TriggerState::Executing,
                        TriggerState::Complete,
                    )
                    .await?;

                if trigger.is_one_shot() {
                    self.store.remove_trigger(&trigger.key).await?;
                } else {
                    let next = next_fire_time(&trigger, Utc::now());
                    trigger.reschedule(fired_at, next);
                    self.store.update_trigger(trigger).await?;
                }
                Ok(())
            }
            Err(e) => {
                error!(
                    job = %trigger.job_key,
                    fire_instance = %execution.fire_instance_id,
                    error = %e,
                    "job execution failed",
                );
                execution.fail(e.to_string());
                self.store.update_execution(execution).await?;

                trigger.previous_fire_time = trigger.next_fire_time;
                trigger.transition(TriggerState::Error);
                self.store.update_trigger(trigger.clone()).await?;

                if let Some(delay) = handler.refire_on_failure() {
                    self.spawn_refire(trigger, delay);
                }
                Ok(())
            }
        }
    }

    /// Re-admits a failed trigger after the handler's re-fire delay.
    ///
    /// The next fire time is left in the past, so the trigger is due as
    /// soon as it returns to Waiting. If the trigger has moved out of
    /// Error in the meantime the re-fire is abandoned.
    fn spawn_refire(&self, trigger: Trigger, delay: std::time::Duration) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match store
                .compare_and_set_state(&trigger.key, TriggerState::Error, TriggerState::Waiting)
                .await
            {
                Ok(true) => {
                    info!(job = %trigger.job_key, "re-admitted failed job for re-fire");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(job = %trigger.job_key, error = %e, "re-fire state update failed");
                }
            }
        });
    }
}
