//! Composite (name, group) keys for schedulable entities.
//!
//! Jobs and triggers are identified by a name scoped within a group. The
//! group defaults to [`DEFAULT_GROUP`] when unspecified, so most callers
//! only ever deal in job names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The group assigned to keys created without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Macro to generate a (name, group) key type.
macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name {
            /// Entity name, unique within its group.
            pub name: String,
            /// Group the entity belongs to.
            pub group: String,
        }

        impl $name {
            /// Creates a key in the default group.
            #[must_use]
            pub fn new(name: impl Into<String>) -> Self {
                Self {
                    name: name.into(),
                    group: DEFAULT_GROUP.to_string(),
                }
            }

            /// Creates a key in an explicit group.
            #[must_use]
            pub fn with_group(name: impl Into<String>, group: impl Into<String>) -> Self {
                Self {
                    name: name.into(),
                    group: group.into(),
                }
            }

            /// Creates a key from a name and an optional group, falling back
            /// to the default group.
            #[must_use]
            pub fn from_parts(name: impl Into<String>, group: Option<String>) -> Self {
                Self {
                    name: name.into(),
                    group: group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }
    };
}

define_key!(
    /// Unique identifier of a schedulable job.
    JobKey
);

define_key!(
    /// Unique identifier of a trigger. One trigger per job in normal use;
    /// forced one-off firings add uniquely-named extra triggers.
    TriggerKey
);

impl From<&JobKey> for TriggerKey {
    fn from(job: &JobKey) -> Self {
        Self {
            name: job.name.clone(),
            group: job.group.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_default_group() {
        let key = JobKey::new("TestJob");
        assert_eq!(key.name, "TestJob");
        assert_eq!(key.group, DEFAULT_GROUP);
    }

    #[test]
    fn from_parts_respects_explicit_group() {
        let key = JobKey::from_parts("TestJob", Some("reports".to_string()));
        assert_eq!(key.group, "reports");

        let key = JobKey::from_parts("TestJob", None);
        assert_eq!(key.group, DEFAULT_GROUP);
    }

    #[test]
    fn display_is_group_dot_name() {
        let key = TriggerKey::with_group("Nightly", "batch");
        assert_eq!(key.to_string(), "batch.Nightly");
    }

    #[test]
    fn trigger_key_from_job_key() {
        let job = JobKey::with_group("SignDocuments", "docs");
        let trigger = TriggerKey::from(&job);
        assert_eq!(trigger.name, "SignDocuments");
        assert_eq!(trigger.group, "docs");
    }

    #[test]
    fn key_equality_and_hash() {
        use std::collections::HashSet;

        let a = JobKey::new("A");
        let b = JobKey::new("A");
        let c = JobKey::with_group("A", "other");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn key_serde_roundtrip() {
        let key = JobKey::with_group("SignDocuments", "docs");
        let json = serde_json::to_string(&key).expect("serialize");
        let parsed: JobKey = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(key, parsed);
    }
}
