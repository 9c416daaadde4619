//! HTTP control plane for scheduler operations.
//!
//! Jobs are addressed by name in the path, with an optional `job_group`
//! query parameter falling back to the default group.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use copper_metronome_core::{JobKey, TriggerKey};
use copper_metronome_scheduler::{Command, Enqueuer, OpStatus, Scheduler};
use copper_metronome_store::{JobExecution, Trigger, TriggerStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::db::PgTriggerStore;
use crate::error::ApiError;

/// Shared state for the control plane.
#[derive(Clone)]
pub struct AppState {
    /// Scheduling operations front door.
    pub scheduler: Scheduler<PgTriggerStore>,
    /// Forced one-off invocation.
    pub enqueuer: Enqueuer<PgTriggerStore>,
    /// Direct store access for read-only history queries.
    pub store: Arc<PgTriggerStore>,
}

/// Builds the control-plane router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs/list", get(list_jobs))
        .route("/jobs/{job_name}", post(schedule_job))
        .route("/jobs/{job_name}", delete(unschedule_job))
        .route("/jobs/{job_name}/trigger", post(trigger_job))
        .route(
            "/jobs/{job_name}/reset-from-error-state",
            put(reset_from_error),
        )
        .route("/jobs/{job_name}/pause", put(pause_job))
        .route("/jobs/{job_name}/resume", put(resume_job))
        .route("/jobs/{job_name}/executions", get(job_executions))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Optional group selector; absent means the default group.
#[derive(Debug, Default, Deserialize)]
pub struct GroupQuery {
    pub job_group: Option<String>,
}

impl GroupQuery {
    fn job_key(self, job_name: String) -> JobKey {
        JobKey::from_parts(job_name, self.job_group)
    }
}

/// Query parameters for scheduling a job. The expression falls back to
/// the request body, then to configuration.
#[derive(Debug, Default, Deserialize)]
pub struct ScheduleQuery {
    pub job_group: Option<String>,
    pub cron_expression: Option<String>,
}

/// Alternative request body carrying the cron expression.
#[derive(Debug, Default, Deserialize)]
pub struct ScheduleRequest {
    pub cron_expression: Option<String>,
}

/// One job with its triggers, as returned by the list endpoint.
#[derive(Debug, Serialize)]
pub struct JobListing {
    pub job: JobKey,
    pub triggers: Vec<Trigger>,
}

async fn schedule_job(
    State(state): State<AppState>,
    Path(job_name): Path<String>,
    Query(query): Query<ScheduleQuery>,
    body: Option<Json<ScheduleRequest>>,
) -> Result<(StatusCode, Json<OpStatus>), ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let job_key = JobKey::from_parts(job_name, query.job_group);
    let cron = query.cron_expression.or(request.cron_expression);
    let status = state.scheduler.schedule(&job_key, cron.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

/// Command wrapping a raw JSON payload handed in over the API.
struct ForcedCommand<'a> {
    job_key: &'a JobKey,
    payload: &'a JsonValue,
}

impl serde::Serialize for ForcedCommand<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.payload.serialize(serializer)
    }
}

impl Command for ForcedCommand<'_> {
    fn job_name(&self) -> &str {
        &self.job_key.name
    }

    fn job_group(&self) -> Option<&str> {
        Some(&self.job_key.group)
    }
}

/// Response body for a forced invocation.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub trigger: TriggerKey,
}

async fn trigger_job(
    State(state): State<AppState>,
    Path(job_name): Path<String>,
    Query(group): Query<GroupQuery>,
    body: Option<Json<JsonValue>>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let payload = body.map(|Json(v)| v).unwrap_or(JsonValue::Null);
    let job_key = group.job_key(job_name);
    let trigger = state
        .enqueuer
        .enqueue(&ForcedCommand {
            job_key: &job_key,
            payload: &payload,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { trigger })))
}

async fn unschedule_job(
    State(state): State<AppState>,
    Path(job_name): Path<String>,
    Query(group): Query<GroupQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .scheduler
        .unschedule(&group.job_key(job_name))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_from_error(
    State(state): State<AppState>,
    Path(job_name): Path<String>,
    Query(group): Query<GroupQuery>,
) -> Result<Json<OpStatus>, ApiError> {
    let status = state
        .scheduler
        .reset_from_error(&group.job_key(job_name))
        .await?;
    Ok(Json(status))
}

async fn pause_job(
    State(state): State<AppState>,
    Path(job_name): Path<String>,
    Query(group): Query<GroupQuery>,
) -> Result<Json<OpStatus>, ApiError> {
    let status = state.scheduler.pause(&group.job_key(job_name)).await?;
    Ok(Json(status))
}

async fn resume_job(
    State(state): State<AppState>,
    Path(job_name): Path<String>,
    Query(group): Query<GroupQuery>,
) -> Result<Json<OpStatus>, ApiError> {
    let status = state.scheduler.resume(&group.job_key(job_name)).await?;
    Ok(Json(status))
}

async fn list_jobs(
    State(state): State<AppState>,
) -> Result<Json<Vec<JobListing>>, ApiError> {
    let jobs = state.scheduler.list_jobs().await?;
    Ok(Json(
        jobs.into_iter()
            .map(|(job, triggers)| JobListing { job, triggers })
            .collect(),
    ))
}

async fn job_executions(
    State(state): State<AppState>,
    Path(job_name): Path<String>,
    Query(group): Query<GroupQuery>,
) -> Result<Json<Vec<JobExecution>>, ApiError> {
    let executions = state
        .store
        .executions_for_job(&group.job_key(job_name))
        .await
        .map_err(copper_metronome_scheduler::SchedulerError::from)?;
    Ok(Json(executions))
}
