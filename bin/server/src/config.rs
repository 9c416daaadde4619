//! Centralized server configuration.
//!
//! Strongly-typed configuration for the scheduler host, loaded via the
//! `config` crate from environment variables.

use copper_metronome_scheduler::SchedulerConfig;
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Address the HTTP control plane listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Scheduling engine configuration, including blocked-trigger recovery.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_has_a_default() {
        assert_eq!(default_listen_addr(), "0.0.0.0:3000");
    }

    #[test]
    fn blocked_recovery_defaults_off() {
        let config: ServerConfig = serde_json::from_value(serde_json::json!({
            "database_url": "postgres://localhost/copper_metronome",
        }))
        .expect("deserialize");
        assert!(config.scheduler.blocked_recovery.jobs.is_empty());
        assert_eq!(config.listen_addr, "0.0.0.0:3000");
    }

    #[test]
    fn blocked_recovery_is_nested_under_scheduler() {
        let config: ServerConfig = serde_json::from_value(serde_json::json!({
            "database_url": "postgres://localhost/copper_metronome",
            "scheduler": {
                "blocked_recovery": { "jobs": ["Reconcile"] },
            },
        }))
        .expect("deserialize");
        assert_eq!(config.scheduler.blocked_recovery.jobs, vec!["Reconcile"]);
        assert_eq!(config.scheduler.blocked_recovery.max_fire_delay_ms, 300_000);
    }
}
