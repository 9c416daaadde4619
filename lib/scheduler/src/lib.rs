//! Scheduling and execution engine for copper-metronome.
//!
//! This crate provides:
//!
//! - **Scheduler Core**: Trigger lifecycle: schedule, unschedule, reset
//!   from error, pause/resume, and query
//! - **Execution Dispatcher**: Pulls due triggers, enforces the per-job
//!   concurrency policy, hands firings to the runner
//! - **Job Runner**: Executes one firing, records the outcome, reschedules
//! - **Recovery Monitor**: Periodic re-admission of errored and stuck
//!   blocked triggers
//! - **Enqueue Manager**: Forced one-off invocation with a typed payload

pub mod config;
pub mod core;
pub mod dispatcher;
pub mod enqueue;
pub mod error;
pub mod handler;
pub mod recovery;
pub mod runner;
pub mod schedule;

pub use config::{BlockedRecoveryConfig, SchedulerConfig};
pub use self::core::{OpStatus, Operation, Scheduler};
pub use dispatcher::Dispatcher;
pub use enqueue::{Command, Enqueuer};
pub use error::SchedulerError;
pub use handler::{CancelToken, HandlerError, JobContext, JobHandler, JobRegistration, JobRegistry};
pub use recovery::RecoveryMonitor;
pub use runner::JobRunner;
pub use schedule::CronSchedule;
