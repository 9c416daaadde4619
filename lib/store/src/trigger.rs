//! Trigger records and their state machine.
//!
//! A trigger binds a cron schedule (or a one-shot fire time) to a job. The
//! trigger row in the store is authoritative: every lifecycle transition is
//! a read-modify-write against it.

use chrono::{DateTime, Utc};
use copper_metronome_core::{JobKey, TriggerKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Lifecycle state of a trigger.
///
/// Normal flow is Waiting → Acquired → Executing → Complete → Waiting
/// (rescheduled from cron). Handler failures divert to Error, concurrency
/// vetoes to Blocked, and explicit operator action to Paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Eligible for acquisition once the next fire time arrives.
    Waiting,
    /// Claimed by a dispatcher pass, not yet executing.
    Acquired,
    /// A firing instance is currently running.
    Executing,
    /// Firing finished; about to be rescheduled.
    Complete,
    /// Handler failed; recovery monitor will re-admit.
    Error,
    /// Vetoed by the per-job concurrency policy.
    Blocked,
    /// Explicitly paused; never acquired.
    Paused,
}

impl TriggerState {
    /// The persisted string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Acquired => "acquired",
            Self::Executing => "executing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
        }
    }

    /// Parses the persisted string form, defaulting unknown values to Error
    /// so a corrupted row surfaces through the recovery path.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "waiting" => Self::Waiting,
            "acquired" => Self::Acquired,
            "executing" => Self::Executing,
            "complete" => Self::Complete,
            "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            _ => Self::Error,
        }
    }
}

/// What to do with a trigger whose fire time passed without acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once now, then continue on schedule.
    #[default]
    Smart,
    /// Fire immediately regardless of how late.
    FireNow,
    /// Skip to the next scheduled window.
    DoNothing,
}

impl MisfirePolicy {
    /// The persisted string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::FireNow => "fire_now",
            Self::DoNothing => "do_nothing",
        }
    }

    /// Parses the persisted string form, defaulting unknown values to Smart.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "fire_now" => Self::FireNow,
            "do_nothing" => Self::DoNothing,
            _ => Self::Smart,
        }
    }
}

/// A durable trigger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Unique identifier of this trigger.
    pub key: TriggerKey,
    /// The job this trigger fires.
    pub job_key: JobKey,
    /// Cron expression; `None` for one-shot triggers.
    pub cron_expression: Option<String>,
    /// Current lifecycle state.
    pub state: TriggerState,
    /// Next scheduled fire time.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// When this trigger last fired.
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Misfire handling policy.
    pub misfire_policy: MisfirePolicy,
    /// Serialized job data carried into each firing.
    pub payload: Option<JsonValue>,
    /// Set when the recovery monitor re-admitted this trigger; the next
    /// firing is marked as a recovery firing and the flag cleared.
    #[serde(default)]
    pub recovering: bool,
    /// Scheduler instance that owns this trigger.
    pub owner: String,
    /// When this trigger was created.
    pub created_at: DateTime<Utc>,
    /// When this trigger was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    /// Creates a cron trigger in Waiting state.
    #[must_use]
    pub fn new(
        key: TriggerKey,
        job_key: JobKey,
        cron_expression: impl Into<String>,
        next_fire_time: Option<DateTime<Utc>>,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            job_key,
            cron_expression: Some(cron_expression.into()),
            state: TriggerState::Waiting,
            next_fire_time,
            previous_fire_time: None,
            misfire_policy: MisfirePolicy::default(),
            payload: None,
            recovering: false,
            owner: owner.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a one-shot trigger firing immediately, optionally carrying a
    /// serialized payload. Used for forced/manual invocation.
    #[must_use]
    pub fn one_shot(
        key: TriggerKey,
        job_key: JobKey,
        payload: Option<JsonValue>,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            job_key,
            cron_expression: None,
            state: TriggerState::Waiting,
            next_fire_time: Some(now),
            previous_fire_time: None,
            misfire_policy: MisfirePolicy::FireNow,
            payload,
            recovering: false,
            owner: owner.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if this trigger has no recurring schedule.
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        self.cron_expression.is_none()
    }

    /// Returns true if the trigger is due for acquisition at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == TriggerState::Waiting
            && self.next_fire_time.is_some_and(|t| t <= now)
    }

    /// Transitions to a new state, touching the update timestamp.
    pub fn transition(&mut self, state: TriggerState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Records a firing and reschedules for the next fire time.
    pub fn reschedule(&mut self, fired_at: DateTime<Utc>, next: Option<DateTime<Utc>>) {
        self.previous_fire_time = Some(fired_at);
        self.next_fire_time = next;
        self.state = TriggerState::Waiting;
        self.recovering = false;
        self.updated_at = Utc::now();
    }
}

/// Durable details of a registered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    /// Unique identifier of the job.
    pub key: JobKey,
    /// Optional human-readable description.
    pub description: Option<String>,
    /// When true, at most one firing of this job executes at a time;
    /// an overlapping firing is vetoed and the trigger goes Blocked.
    pub disallow_concurrent: bool,
}

impl JobDetail {
    /// Creates a job detail allowing concurrent executions.
    #[must_use]
    pub fn new(key: JobKey) -> Self {
        Self {
            key,
            description: None,
            disallow_concurrent: false,
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
