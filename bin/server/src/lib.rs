//! Scheduler host binary: Postgres-backed trigger store, background
//! scheduling loops, and an HTTP control plane for operating on jobs.

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod routes;
