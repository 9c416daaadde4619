//! Job handlers and the dispatch-time registry.
//!
//! The source system resolved job types reflectively; here that is a
//! registry populated at startup: job name to a polymorphic handler, looked
//! up by string key when a trigger fires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use copper_metronome_core::{FireInstanceId, JobKey};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default delay before a failed firing of a re-fire-capable job is retried.
pub const DEFAULT_REFIRE_DELAY: Duration = Duration::from_millis(10_000);

/// Cooperative cancellation handle passed to job handlers.
///
/// The dispatcher never forcibly interrupts a running handler; handlers are
/// expected to poll [`is_cancelled`](CancelToken::is_cancelled) or await
/// [`cancelled`](CancelToken::cancelled) at convenient points.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Wraps a shutdown watch receiver.
    #[must_use]
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until cancellation is requested.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling; this token can never fire.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Context handed to a handler for one firing.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job being fired.
    pub job_key: JobKey,
    /// Unique identifier of this firing.
    pub fire_instance_id: FireInstanceId,
    /// When the firing was scheduled to happen.
    pub scheduled_time: DateTime<Utc>,
    /// Serialized job data from the trigger, if any.
    pub payload: Option<JsonValue>,
    /// True if this firing was created by recovery.
    pub recovering: bool,
    /// Cooperative cancellation handle.
    pub cancel: CancelToken,
}

impl JobContext {
    /// Deserializes the payload into a typed command.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidPayload`] if the payload does not
    /// deserialize into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<Option<T>, HandlerError> {
        match &self.payload {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HandlerError::InvalidPayload {
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}

/// Errors from job handler execution.
///
/// These are recorded on the firing's execution record and drive the
/// trigger to Error; they never propagate past the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The job body failed.
    Failed { message: String },
    /// No handler is registered for the job name.
    MissingHandler { job: String },
    /// The trigger payload does not match the handler's command type.
    InvalidPayload { reason: String },
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { message } => write!(f, "job execution failed: {message}"),
            Self::MissingHandler { job } => {
                write!(f, "no handler registered for job '{job}'")
            }
            Self::InvalidPayload { reason } => write!(f, "invalid job payload: {reason}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Trait for executing a unit of work bound to a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Executes one firing.
    async fn execute(&self, ctx: JobContext) -> Result<(), HandlerError>;

    /// Declares the re-fire-on-failure capability.
    ///
    /// Returning a delay opts the job into a one-off re-fire that many
    /// milliseconds after a failed firing, ahead of the recovery monitor's
    /// longer interval. [`DEFAULT_REFIRE_DELAY`] is the conventional value.
    fn refire_on_failure(&self) -> Option<Duration> {
        None
    }
}

/// A registered job: its handler plus per-job policy.
#[derive(Clone)]
pub struct JobRegistration {
    /// The handler invoked for each firing.
    pub handler: Arc<dyn JobHandler>,
    /// When true, overlapping firings of this job are vetoed.
    pub disallow_concurrent: bool,
    /// Optional human-readable description.
    pub description: Option<String>,
}

impl JobRegistration {
    /// Creates a registration allowing concurrent executions.
    #[must_use]
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            handler,
            disallow_concurrent: false,
            description: None,
        }
    }

    /// Disallows concurrent executions of this job.
    #[must_use]
    pub fn non_concurrent(mut self) -> Self {
        self.disallow_concurrent = true;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Registry mapping job names to handlers, populated at startup.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, JobRegistration>,
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a job name, replacing any previous one.
    pub fn register(&mut self, job_name: impl Into<String>, registration: JobRegistration) {
        self.handlers.insert(job_name.into(), registration);
    }

    /// Looks up a registration by job name.
    #[must_use]
    pub fn get(&self, job_name: &str) -> Option<&JobRegistration> {
        self.handlers.get(job_name)
    }

    /// Returns true if a handler is registered for the job name.
    #[must_use]
    pub fn contains(&self, job_name: &str) -> bool {
        self.handlers.contains_key(job_name)
    }

    /// Iterates over registered job names.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// A handler that records its invocations (for testing).
#[derive(Default)]
pub struct MockHandler {
    /// If set, all executions fail with this error.
    pub fail_with: std::sync::Mutex<Option<HandlerError>>,
    /// Re-fire delay reported to the runner.
    pub refire_delay: Option<Duration>,
    invocations: std::sync::Mutex<Vec<JobContext>>,
}

impl MockHandler {
    /// Creates a mock handler that succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Creates a mock handler that fails with the given message.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: std::sync::Mutex::new(Some(HandlerError::Failed {
                message: message.into(),
            })),
            ..Self::default()
        }
    }

    /// Sets the re-fire delay reported for failures.
    #[must_use]
    pub fn with_refire_delay(mut self, delay: Duration) -> Self {
        self.refire_delay = Some(delay);
        self
    }

    /// Clears the failure, so subsequent executions succeed.
    pub fn succeed_from_now_on(&self) {
        *self.fail_with.lock().unwrap() = None;
    }

    /// Contexts of all invocations so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<JobContext> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl JobHandler for MockHandler {
    async fn execute(&self, ctx: JobContext) -> Result<(), HandlerError> {
        self.invocations.lock().unwrap().push(ctx);
        match self.fail_with.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn refire_on_failure(&self) -> Option<Duration> {
        self.refire_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn context(payload: Option<JsonValue>) -> JobContext {
        JobContext {
            job_key: JobKey::new("TestJob"),
            fire_instance_id: FireInstanceId::new(),
            scheduled_time: Utc::now(),
            payload,
            recovering: false,
            cancel: CancelToken::never(),
        }
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut registry = JobRegistry::new();
        registry.register(
            "SignDocuments",
            JobRegistration::new(Arc::new(MockHandler::succeeding())).non_concurrent(),
        );

        assert!(registry.contains("SignDocuments"));
        assert!(registry.get("SignDocuments").unwrap().disallow_concurrent);
        assert!(registry.get("Unknown").is_none());
    }

    #[test]
    fn payload_deserializes_into_command_type() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct SignCommand {
            document_id: u64,
        }

        let ctx = context(Some(serde_json::json!({"document_id": 42})));
        let command: Option<SignCommand> = ctx.payload_as().expect("deserialize");
        assert_eq!(command, Some(SignCommand { document_id: 42 }));

        let ctx = context(None);
        let command: Option<SignCommand> = ctx.payload_as().expect("no payload");
        assert!(command.is_none());
    }

    #[test]
    fn mismatched_payload_is_invalid() {
        #[derive(Debug, Deserialize)]
        struct SignCommand {
            #[allow(dead_code)]
            document_id: u64,
        }

        let ctx = context(Some(serde_json::json!({"other": true})));
        let result: Result<Option<SignCommand>, _> = ctx.payload_as();
        assert!(matches!(result, Err(HandlerError::InvalidPayload { .. })));
    }

    #[tokio::test]
    async fn mock_handler_records_invocations() {
        let handler = MockHandler::succeeding();
        handler.execute(context(None)).await.unwrap();
        handler.execute(context(None)).await.unwrap();
        assert_eq!(handler.invocation_count(), 2);
    }

    #[tokio::test]
    async fn mock_handler_can_recover() {
        let handler = MockHandler::failing("boom");
        assert!(handler.execute(context(None)).await.is_err());

        handler.succeed_from_now_on();
        assert!(handler.execute(context(None)).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_token_observes_cancellation() {
        let (tx, rx) = watch::channel(false);
        let token = CancelToken::new(rx);
        assert!(!token.is_cancelled());

        tx.send(true).expect("send");
        assert!(token.is_cancelled());

        let mut waiting = token.clone();
        // Must return promptly since cancellation already happened.
        waiting.cancelled().await;
    }

    #[test]
    fn never_token_is_not_cancelled() {
        assert!(!CancelToken::never().is_cancelled());
    }
}
