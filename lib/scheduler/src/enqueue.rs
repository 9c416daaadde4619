//! Command enqueueing: durable one-shot firings carrying a serialized
//! command payload, executed through the same dispatch path as cron
//! triggers.

use copper_metronome_core::{JobKey, TriggerKey};
use copper_metronome_store::{JobDetail, StoreError, Trigger, TriggerStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::handler::JobRegistry;

/// A serializable command that knows which job executes it.
pub trait Command: Serialize {
    /// Name of the job that handles this command.
    fn job_name(&self) -> &str;

    /// Job group, defaulting to the default group.
    fn job_group(&self) -> Option<&str> {
        None
    }
}

/// Enqueues commands as immediately-due one-shot triggers.
pub struct Enqueuer<S> {
    store: Arc<S>,
    registry: Arc<JobRegistry>,
    config: Arc<SchedulerConfig>,
}

impl<S> Clone for Enqueuer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: TriggerStore> Enqueuer<S> {
    #[must_use]
    pub fn new(store: Arc<S>, registry: Arc<JobRegistry>, config: Arc<SchedulerConfig>) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Persists `command` as a one-shot trigger for its job.
    ///
    /// The command survives process restarts: once the trigger is stored,
    /// the dispatcher will fire it on this or any other instance. Returns
    /// the key of the created trigger.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Serialization`] if the command does not
    /// serialize to JSON.
    pub async fn enqueue<C: Command>(&self, command: &C) -> Result<TriggerKey, SchedulerError> {
        let payload =
            serde_json::to_value(command).map_err(|e| SchedulerError::Serialization {
                reason: e.to_string(),
            })?;
        // Unit commands carry no payload.
        let payload = match payload {
            serde_json::Value::Null => None,
            value => Some(value),
        };
        let job_key = JobKey::from_parts(
            command.job_name(),
            command.job_group().map(str::to_owned),
        );

        if self.store.get_job(&job_key).await?.is_none() {
            let mut detail = JobDetail::new(job_key.clone());
            if let Some(registration) = self.registry.get(&job_key.name) {
                if registration.disallow_concurrent {
                    detail = detail.non_concurrent();
                }
            }
            self.store.insert_job(detail).await?;
        }

        // Unique per enqueue so pending commands for one job coexist.
        let trigger_key = TriggerKey::with_group(
            format!("{}-enqueue-{}", job_key.name, Ulid::new()),
            job_key.group.clone(),
        );
        let trigger = Trigger::one_shot(
            trigger_key.clone(),
            job_key.clone(),
            payload,
            self.config.instance_name.clone(),
        );
        match self.store.insert_trigger(trigger).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { key }) => {
                // ULID collision is not a practical concern; surface it
                // rather than silently dropping the command.
                return Err(SchedulerError::Serialization {
                    reason: format!("enqueue trigger key collision: {key}"),
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(job = %job_key, trigger = %trigger_key, "enqueued command");
        Ok(trigger_key)
    }
}
