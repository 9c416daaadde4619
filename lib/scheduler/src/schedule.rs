//! Cron-based next-fire-time computation.

use crate::error::SchedulerError;
use chrono::{DateTime, Utc};
use copper_metronome_store::Trigger;
use std::str::FromStr;

/// A cron schedule.
///
/// Expressions use the seconds-first form (`sec min hour day-of-month month
/// day-of-week [year]`); `?` is accepted for the day fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    /// The cron expression.
    pub expression: String,
}

impl CronSchedule {
    /// Creates a new cron schedule.
    #[must_use]
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    /// Validates the cron expression.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidCronExpression`] if the expression
    /// does not parse.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        cron::Schedule::from_str(&self.expression).map(|_| ()).map_err(|e| {
            SchedulerError::InvalidCronExpression {
                expression: self.expression.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Calculates the next execution time strictly after the given time.
    ///
    /// Returns `None` for unparseable expressions or exhausted schedules.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let schedule = cron::Schedule::from_str(&self.expression).ok()?;
        schedule.after(&after).next()
    }
}

/// Computes the next fire time for a trigger at `now`.
///
/// One-shot triggers (no cron expression) fire immediately.
#[must_use]
pub fn next_fire_time(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &trigger.cron_expression {
        Some(expression) => CronSchedule::new(expression).next_after(now),
        None => Some(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copper_metronome_core::{JobKey, TriggerKey};

    #[test]
    fn valid_expression_passes_validation() {
        assert!(CronSchedule::new("0 0 2 * * *").validate().is_ok());
        // Quartz-style with ? day-of-month
        assert!(CronSchedule::new("0/5 * * ? * *").validate().is_ok());
    }

    #[test]
    fn invalid_expression_fails_validation() {
        let err = CronSchedule::new("not a cron").validate().unwrap_err();
        match err {
            SchedulerError::InvalidCronExpression { expression, .. } => {
                assert_eq!(expression, "not a cron");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn next_after_is_strictly_in_the_future() {
        let schedule = CronSchedule::new("0/5 * * ? * *");
        let now = Utc::now();
        let next = schedule.next_after(now).expect("next fire time");
        assert!(next > now);
        // Every-5-seconds schedule fires within 5 seconds
        assert!(next - now <= chrono::Duration::seconds(5));
    }

    #[test]
    fn next_after_advances_across_calls() {
        let schedule = CronSchedule::new("0 0 2 * * *");
        let now = Utc::now();
        let first = schedule.next_after(now).expect("first");
        let second = schedule.next_after(first).expect("second");
        assert!(second > first);
        assert_eq!(second - first, chrono::Duration::hours(24));
    }

    #[test]
    fn next_after_invalid_expression_is_none() {
        assert!(CronSchedule::new("garbage").next_after(Utc::now()).is_none());
    }

    #[test]
    fn one_shot_trigger_fires_now() {
        let trigger = Trigger::one_shot(
            TriggerKey::new("Manual-1"),
            JobKey::new("Manual"),
            None,
            "test-instance",
        );
        let now = Utc::now();
        assert_eq!(next_fire_time(&trigger, now), Some(now));
    }

    #[test]
    fn cron_trigger_fires_per_expression() {
        let trigger = Trigger::new(
            TriggerKey::new("Nightly"),
            JobKey::new("Nightly"),
            "0 0 2 * * *",
            None,
            "test-instance",
        );
        let now = Utc::now();
        let next = next_fire_time(&trigger, now).expect("next fire time");
        assert!(next > now);
    }
}
