//! Durable trigger store for the copper-metronome scheduler.
//!
//! This crate provides:
//!
//! - **Trigger Model**: Triggers, their state machine, and job details
//! - **Execution Records**: Per-firing audit records (fired-trigger history)
//! - **Storage Trait**: The [`TriggerStore`] seam implemented by the
//!   in-memory store here and the PostgreSQL store in the server binary
//!
//! All durable state transitions are read-modify-write operations against
//! the store; the per-trigger row guard (or equivalent CAS) is the sole
//! concurrency-control primitive across dispatcher threads.

pub mod error;
pub mod execution;
pub mod memory;
pub mod store;
pub mod trigger;

pub use error::StoreError;
pub use execution::JobExecution;
pub use memory::MemoryTriggerStore;
pub use store::TriggerStore;
pub use trigger::{JobDetail, MisfirePolicy, Trigger, TriggerState};
