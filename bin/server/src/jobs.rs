//! Built-in jobs and registry wiring.
//!
//! Application jobs get registered here. The server ships with a heartbeat
//! job so a fresh deployment has something observable to schedule.

use async_trait::async_trait;
use copper_metronome_scheduler::{
    HandlerError, JobContext, JobHandler, JobRegistration, JobRegistry,
};
use std::sync::Arc;
use tracing::info;

/// Logs a liveness line each firing. Schedule it with a short cron
/// expression to verify the dispatch path end to end.
pub struct HeartbeatJob;

#[async_trait]
impl JobHandler for HeartbeatJob {
    async fn execute(&self, ctx: JobContext) -> Result<(), HandlerError> {
        info!(
            fire_instance = %ctx.fire_instance_id,
            scheduled_time = %ctx.scheduled_time,
            recovering = ctx.recovering,
            "heartbeat",
        );
        Ok(())
    }
}

/// Builds the registry of jobs this server can execute.
#[must_use]
pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(
        "Heartbeat",
        JobRegistration::new(Arc::new(HeartbeatJob))
            .with_description("Liveness log line on each firing"),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_registered() {
        let registry = registry();
        assert!(registry.contains("Heartbeat"));
        assert!(!registry.get("Heartbeat").unwrap().disallow_concurrent);
    }
}
