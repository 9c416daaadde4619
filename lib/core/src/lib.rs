//! Core domain types and utilities for the copper-metronome scheduler.
//!
//! This crate provides the foundational identifier and key types used
//! throughout the copper-metronome job scheduling platform.

pub mod id;
pub mod key;

pub use id::FireInstanceId;
pub use key::{DEFAULT_GROUP, JobKey, TriggerKey};
