//! HTTP error mapping for scheduler operations.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use copper_metronome_scheduler::SchedulerError;
use copper_metronome_store::StoreError;
use serde::Serialize;
use tracing::error;

/// An API error carrying the status code it should surface as.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Wire shape of an error response body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::AlreadyScheduled { .. } => StatusCode::CONFLICT,
            SchedulerError::MissingCronExpression { .. }
            | SchedulerError::InvalidCronExpression { .. }
            | SchedulerError::Serialization { .. } => StatusCode::BAD_REQUEST,
            SchedulerError::TriggerNotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %e, "scheduler operation failed");
        }
        Self::new(status, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copper_metronome_core::TriggerKey;

    #[test]
    fn scheduler_errors_map_to_statuses() {
        let conflict: ApiError = SchedulerError::AlreadyScheduled {
            key: TriggerKey::new("Heartbeat"),
        }
        .into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let bad_request: ApiError = SchedulerError::InvalidCronExpression {
            expression: "nope".into(),
            reason: "unparseable".into(),
        }
        .into();
        assert_eq!(bad_request.status, StatusCode::BAD_REQUEST);

        let not_found: ApiError = SchedulerError::TriggerNotFound {
            key: TriggerKey::new("Heartbeat"),
        }
        .into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let internal: ApiError = SchedulerError::Store(StoreError::Backend {
            reason: "connection refused".into(),
        })
        .into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
