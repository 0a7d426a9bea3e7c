//! Ordered registry of known issues.
//!
//! Iteration order is match priority: when classifying a log, the first issue
//! that hits wins. The built-in issues are enumerated explicitly in
//! [`default_issues`].

use crate::types::{Issue, RetryPolicy};
use regex::Regex;
use thiserror::Error;

/// Grouping hash shared by every out-of-memory flavor.
pub const OOM_GROUPING_HASH: &str = "oom";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("issue '{grouping_hash}' has neither matching_text nor matching_pattern")]
    EmptyMatcher { grouping_hash: String },
    #[error("invalid matching_pattern for issue '{grouping_hash}': {source}")]
    InvalidPattern {
        grouping_hash: String,
        #[source]
        source: regex::Error,
    },
}

/// The compiled-in known issues, in priority order.
pub fn default_issues() -> Vec<Issue> {
    vec![
        // Fake checkers for exercising the tool itself.
        Issue::new(
            "Fake failure",
            "Detected fake failure. Beep boop.",
            "FAKE FAILURE NOT REAL",
            "fake-failure",
            RetryPolicy::Ack,
        ),
        Issue::new(
            "Fake failure pattern",
            "Detected fake failure pattern. Beep boop.",
            "",
            "fake-failure",
            RetryPolicy::Ack,
        )
        .with_pattern("FAKE_FAILURE_[a-zA-Z]"),
        Issue::new(
            "FTL rate limit",
            "Detected FTL rate limit. Retrying in 1 minute.",
            "429 Too Many Requests",
            "ftl-rate-limit",
            RetryPolicy::delayed_default(),
        ),
        Issue::new(
            "Generic OOM",
            "Detected OOM. Retrying immediately.",
            "Java heap space",
            OOM_GROUPING_HASH,
            RetryPolicy::Immediate,
        ),
        Issue::new(
            "Inconclusive FTL infrastructure failure",
            "Detected inconclusive FTL infrastructure failure. Retrying immediately.",
            "Infrastructure failure",
            "ftl-infrastructure-failure",
            RetryPolicy::Immediate,
        ),
        Issue::new(
            "Flank timeout",
            "Detected a flank timeout. Retrying immediately.",
            "Canceling flank due to timeout",
            "flank-timeout",
            RetryPolicy::Immediate,
        ),
        Issue::new(
            "R8 OOM",
            "Detected a OOM in R8. Retrying immediately.",
            "Out of space in CodeCache",
            OOM_GROUPING_HASH,
            RetryPolicy::Immediate,
        ),
        Issue::new(
            "OOM killed by kernel",
            "Detected a OOM that was killed by the kernel. Retrying immediately.",
            "Gradle build daemon disappeared unexpectedly",
            OOM_GROUPING_HASH,
            RetryPolicy::Immediate,
        )
        .with_description("The kernel OOM killer took down the Gradle daemon."),
    ]
}

/// An issue with its matchers prepared for scanning.
#[derive(Debug, Clone)]
pub(crate) struct CatalogEntry {
    pub(crate) issue: Issue,
    /// Lowercased `matching_text`; `None` when the text is empty.
    text: Option<String>,
    pattern: Option<Regex>,
}

impl CatalogEntry {
    fn compile(issue: Issue) -> Result<Self, CatalogError> {
        let text = (!issue.matching_text.is_empty()).then(|| issue.matching_text.to_lowercase());
        let pattern = match issue.matching_pattern.as_deref() {
            Some(p) if !p.is_empty() => {
                Some(Regex::new(p).map_err(|source| CatalogError::InvalidPattern {
                    grouping_hash: issue.grouping_hash.clone(),
                    source,
                })?)
            }
            _ => None,
        };

        if text.is_none() && pattern.is_none() {
            return Err(CatalogError::EmptyMatcher {
                grouping_hash: issue.grouping_hash,
            });
        }

        Ok(Self {
            issue,
            text,
            pattern,
        })
    }

    /// Check a single line. `lowered` must be `line.to_lowercase()`.
    pub(crate) fn matches(&self, line: &str, lowered: &str) -> bool {
        if let Some(text) = &self.text {
            if lowered.contains(text.as_str()) {
                return true;
            }
        }
        self.pattern.as_ref().is_some_and(|p| p.is_match(line))
    }
}

/// Ordered collection of known issues; immutable once built.
#[derive(Debug, Clone)]
pub struct IssueCatalog {
    entries: Vec<CatalogEntry>,
}

impl IssueCatalog {
    /// Build a catalog from issues in priority order.
    pub fn new(issues: Vec<Issue>) -> Result<Self, CatalogError> {
        let entries = issues
            .into_iter()
            .map(CatalogEntry::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// The built-in catalog.
    pub fn defaults() -> Self {
        Self::new(default_issues()).expect("built-in issues have valid matchers")
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.entries.iter().map(|e| &e.issue)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }
}

impl Default for IssueCatalog {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_required_kinds() {
        let catalog = IssueCatalog::defaults();
        let issues: Vec<&Issue> = catalog.issues().collect();
        assert_eq!(issues.len(), default_issues().len());

        let oom = issues
            .iter()
            .find(|i| i.matching_text == "Java heap space")
            .unwrap();
        assert_eq!(oom.grouping_hash, OOM_GROUPING_HASH);
        assert_eq!(oom.retry_signal, RetryPolicy::Immediate);

        let rate_limit = issues
            .iter()
            .find(|i| i.matching_text == "429 Too Many Requests")
            .unwrap();
        assert_eq!(rate_limit.retry_signal, RetryPolicy::Delayed { delay_ms: 60_000 });

        assert!(issues
            .iter()
            .any(|i| i.retry_signal == RetryPolicy::Ack && i.grouping_hash == "fake-failure"));
    }

    #[test]
    fn oom_flavors_share_grouping_hash() {
        let count = default_issues()
            .iter()
            .filter(|i| i.grouping_hash == OOM_GROUPING_HASH)
            .count();
        assert_eq!(count, 3);
    }

    #[test]
    fn text_matching_is_case_insensitive() {
        let entry = CatalogEntry::compile(Issue::new(
            "OOM",
            "oom",
            "Java Heap Space",
            "oom",
            RetryPolicy::Immediate,
        ))
        .unwrap();
        let line = "java.lang.OutOfMemoryError: JAVA HEAP SPACE";
        assert!(entry.matches(line, &line.to_lowercase()));
    }

    #[test]
    fn pattern_only_issue_ignores_empty_text() {
        let entry = CatalogEntry::compile(
            Issue::new("p", "p", "", "p", RetryPolicy::Ack).with_pattern("FAKE_FAILURE_[a-zA-Z]"),
        )
        .unwrap();
        let hit = "xxFAKE_FAILURE_ayy";
        let miss = "xxFAKE_FAILURE-ayy";
        assert!(entry.matches(hit, &hit.to_lowercase()));
        assert!(!entry.matches(miss, &miss.to_lowercase()));
    }

    #[test]
    fn rejects_issue_without_matcher() {
        let result = IssueCatalog::new(vec![Issue::new("x", "x", "", "empty", RetryPolicy::Ack)]);
        match result {
            Err(CatalogError::EmptyMatcher { grouping_hash }) => assert_eq!(grouping_hash, "empty"),
            other => panic!("expected EmptyMatcher, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_pattern() {
        let result = IssueCatalog::new(vec![
            Issue::new("x", "x", "", "bad", RetryPolicy::Ack).with_pattern("([unclosed")
        ]);
        assert!(matches!(result, Err(CatalogError::InvalidPattern { .. })));
    }

    #[test]
    fn preserves_priority_order() {
        let catalog = IssueCatalog::new(vec![
            Issue::new("b", "b", "b", "second", RetryPolicy::Ack),
            Issue::new("a", "a", "a", "first", RetryPolicy::Ack),
        ])
        .unwrap();
        let hashes: Vec<&str> = catalog.issues().map(|i| i.grouping_hash.as_str()).collect();
        assert_eq!(hashes, vec!["second", "first"]);
    }
}
