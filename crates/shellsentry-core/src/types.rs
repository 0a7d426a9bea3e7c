//! Core types for known issues and retry signals.
//!
//! An [`Issue`] describes one known failure signature along with the retry
//! policy it implies. Classifying a log produces a [`RetrySignal`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Delay applied to `delayed` issues that don't specify one.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// A known failure signature.
///
/// Field names match the `known_issues` entries of the JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Issue {
    /// Human-readable summary, used as the report title.
    pub message: String,
    /// Text emitted to operators when this issue is detected.
    pub log_message: String,
    /// Literal substring searched for in log lines (case-insensitive).
    #[serde(default)]
    pub matching_text: String,
    /// Optional regular expression searched for in log lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_pattern: Option<String>,
    /// Stable key used to cluster reports of the same issue over time.
    ///
    /// May be shared across issues that are part of the same general problem.
    pub grouping_hash: String,
    /// Retry policy implied by this issue.
    pub retry_signal: RetryPolicy,
    /// Free-form documentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Issue {
    /// Create an issue matched by literal text.
    pub fn new(
        message: impl Into<String>,
        log_message: impl Into<String>,
        matching_text: impl Into<String>,
        grouping_hash: impl Into<String>,
        retry_signal: RetryPolicy,
    ) -> Self {
        Self {
            message: message.into(),
            log_message: log_message.into(),
            matching_text: matching_text.into(),
            matching_pattern: None,
            grouping_hash: grouping_hash.into(),
            retry_signal,
            description: None,
        }
    }

    /// Set the regular expression this issue also matches on.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.matching_pattern = Some(pattern.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Retry policy template attached to an [`Issue`].
///
/// Serialized as an internally tagged object, e.g.
/// `{"type": "delayed", "delay_ms": 60000}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Matching this issue is not actionable.
    Unknown,
    /// Recognized, but cannot be retried.
    Ack,
    /// Retry with no delay.
    Immediate,
    /// Retry after `delay_ms` milliseconds.
    Delayed {
        #[serde(alias = "delay")]
        delay_ms: u64,
    },
}

impl RetryPolicy {
    /// A delayed policy using [`DEFAULT_RETRY_DELAY`].
    pub fn delayed_default() -> Self {
        Self::Delayed {
            delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ack => "ack",
            Self::Immediate => "immediate",
            Self::Delayed { .. } => "delayed",
        }
    }

    /// Build the signal this policy produces for a matched issue.
    pub fn signal_for(self, issue: Issue) -> RetrySignal {
        match self {
            Self::Unknown => RetrySignal::Unknown,
            Self::Ack => RetrySignal::Ack(issue),
            Self::Immediate => RetrySignal::RetryImmediately(issue),
            Self::Delayed { delay_ms } => RetrySignal::RetryDelayed {
                issue,
                delay: Duration::from_millis(delay_ms),
            },
        }
    }
}

/// Outcome of classifying a failed command's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrySignal {
    /// No known issue matched.
    Unknown,
    /// A known issue matched but is not retryable.
    Ack(Issue),
    /// Retry the command right away.
    RetryImmediately(Issue),
    /// Retry the command after `delay`.
    RetryDelayed { issue: Issue, delay: Duration },
}

impl RetrySignal {
    /// The matched issue, if any. Only `Unknown` has none.
    pub fn issue(&self) -> Option<&Issue> {
        match self {
            Self::Unknown => None,
            Self::Ack(issue) | Self::RetryImmediately(issue) => Some(issue),
            Self::RetryDelayed { issue, .. } => Some(issue),
        }
    }

    /// Whether this signal asks for another run of the command.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryImmediately(_) | Self::RetryDelayed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ack(_) => "ack",
            Self::RetryImmediately(_) => "retry_immediately",
            Self::RetryDelayed { .. } => "retry_delayed",
        }
    }
}

impl fmt::Display for RetrySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Ack(issue) => write!(f, "Ack({})", issue.grouping_hash),
            Self::RetryImmediately(issue) => {
                write!(f, "RetryImmediately({})", issue.grouping_hash)
            }
            Self::RetryDelayed { issue, delay } => write!(
                f,
                "RetryDelayed({}, {}ms)",
                issue.grouping_hash,
                delay.as_millis()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(policy: RetryPolicy) -> Issue {
        Issue::new("Test", "Detected test", "test text", "test", policy)
    }

    #[test]
    fn policy_deserializes_tagged_object() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"type":"delayed","delay_ms":60000}"#).unwrap();
        assert_eq!(policy, RetryPolicy::delayed_default());

        let policy: RetryPolicy = serde_json::from_str(r#"{"type":"immediate"}"#).unwrap();
        assert_eq!(policy, RetryPolicy::Immediate);
    }

    #[test]
    fn delayed_policy_accepts_delay_alias() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"type":"delayed","delay":1500}"#).unwrap();
        assert_eq!(policy, RetryPolicy::Delayed { delay_ms: 1500 });
    }

    #[test]
    fn delayed_policy_requires_delay() {
        let result = serde_json::from_str::<RetryPolicy>(r#"{"type":"delayed"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn policy_rejects_unknown_type() {
        let result = serde_json::from_str::<RetryPolicy>(r#"{"type":"forever"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn signal_for_maps_each_policy() {
        assert_eq!(
            RetryPolicy::Unknown.signal_for(issue(RetryPolicy::Unknown)),
            RetrySignal::Unknown
        );
        assert!(matches!(
            RetryPolicy::Ack.signal_for(issue(RetryPolicy::Ack)),
            RetrySignal::Ack(_)
        ));
        assert!(matches!(
            RetryPolicy::Immediate.signal_for(issue(RetryPolicy::Immediate)),
            RetrySignal::RetryImmediately(_)
        ));
        match (RetryPolicy::Delayed { delay_ms: 250 }).signal_for(issue(RetryPolicy::Ack)) {
            RetrySignal::RetryDelayed { delay, .. } => {
                assert_eq!(delay, Duration::from_millis(250));
            }
            other => panic!("expected RetryDelayed, got {other:?}"),
        }
    }

    #[test]
    fn only_unknown_lacks_issue() {
        assert!(RetrySignal::Unknown.issue().is_none());
        let ack = RetrySignal::Ack(issue(RetryPolicy::Ack));
        assert_eq!(ack.issue().unwrap().grouping_hash, "test");
        assert!(!ack.is_retry());
        assert!(RetrySignal::RetryImmediately(issue(RetryPolicy::Immediate)).is_retry());
    }

    #[test]
    fn display_includes_grouping_hash_and_delay() {
        let signal = RetryPolicy::delayed_default().signal_for(issue(RetryPolicy::Ack));
        assert_eq!(signal.to_string(), "RetryDelayed(test, 60000ms)");
        assert_eq!(RetrySignal::Unknown.to_string(), "Unknown");
    }
}
