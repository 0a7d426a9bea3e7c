//! Failure report data model.
//!
//! A [`FailureReport`] is what gets delivered to the crash-aggregation sink:
//! the matched issue keyed by its grouping hash, plus metadata tabs describing
//! the run and the CI environment ([`CiContext`]).

use crate::types::{Issue, RetrySignal};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const ENV_JOB_ID: &str = "BUILDKITE_JOB_ID";
pub const ENV_BUILD_ID: &str = "BUILDKITE_BUILD_ID";
pub const ENV_BUILD_URL: &str = "BUILDKITE_BUILD_URL";
pub const ENV_STEP_KEY: &str = "BUILDKITE_STEP_KEY";
pub const ENV_COMMAND: &str = "BUILDKITE_COMMAND";
pub const ENV_BRANCH: &str = "BUILDKITE_BRANCH";

/// Branch prefixes used by merge queues (aviator and GitHub).
const MERGE_QUEUE_PREFIXES: &[&str] = &["mq-", "gh-readonly-queue"];

pub const TAB_RUN_INFO: &str = "Run Info";
pub const TAB_CI: &str = "BuildKite";
pub const TAB_DEVICE: &str = "Device";

/// Where in the dev cycle a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStage {
    Main,
    MergeQueue,
    PullRequest,
}

impl ReleaseStage {
    /// Derive the stage from a branch name.
    pub fn for_branch(branch: &str) -> Self {
        if branch == "main" {
            Self::Main
        } else if MERGE_QUEUE_PREFIXES.iter().any(|p| branch.starts_with(p)) {
            Self::MergeQueue
        } else {
            Self::PullRequest
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::MergeQueue => "merge-queue",
            Self::PullRequest => "pull-request",
        }
    }
}

/// CI environment metadata attached to reports.
///
/// Built once from the environment (or any lookup in tests) and passed in
/// explicitly; nothing downstream reads env vars.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CiContext {
    pub job_id: Option<String>,
    pub build_id: Option<String>,
    pub build_url: Option<String>,
    pub step_key: Option<String>,
    pub command: Option<String>,
    pub branch: Option<String>,
}

impl CiContext {
    /// Read the context from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the context from a key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            job_id: get(ENV_JOB_ID),
            build_id: get(ENV_BUILD_ID),
            build_url: get(ENV_BUILD_URL),
            step_key: get(ENV_STEP_KEY),
            command: get(ENV_COMMAND),
            branch: get(ENV_BRANCH),
        }
    }

    pub fn release_stage(&self) -> Option<ReleaseStage> {
        self.branch.as_deref().map(ReleaseStage::for_branch)
    }
}

/// Metadata tabs: tab name -> key -> value.
pub type MetadataTabs = BTreeMap<String, BTreeMap<String, Value>>;

/// A classified failure, ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    /// Clustering key; reports with the same hash group together.
    pub grouping_hash: String,
    /// Short, stable title of the issue.
    pub error_class: String,
    /// Operator-facing detail.
    pub message: String,
    /// Retry signal kind (e.g. `retry_immediately`).
    pub signal: String,
    pub after_retry: bool,
    pub build_scan_url: Option<String>,
    pub app_version: String,
    /// Step key, used to slice reports by pipeline step.
    pub app_type: Option<String>,
    pub release_stage: Option<ReleaseStage>,
    pub metadata: MetadataTabs,
}

impl FailureReport {
    /// Start a report for a matched issue.
    pub fn new(issue: &Issue, signal: &RetrySignal) -> Self {
        Self {
            grouping_hash: issue.grouping_hash.clone(),
            error_class: issue.message.clone(),
            message: issue.log_message.clone(),
            signal: signal.as_str().to_string(),
            after_retry: false,
            build_scan_url: None,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            app_type: None,
            release_stage: None,
            metadata: MetadataTabs::new(),
        }
        .with_entry(TAB_RUN_INFO, "After-Retry", false)
    }

    /// Build a report from a signal; `None` for [`RetrySignal::Unknown`].
    pub fn from_signal(signal: &RetrySignal) -> Option<Self> {
        signal.issue().map(|issue| Self::new(issue, signal))
    }

    /// Mark whether this failure happened on the retry run.
    pub fn with_after_retry(mut self, after_retry: bool) -> Self {
        self.after_retry = after_retry;
        self.with_entry(TAB_RUN_INFO, "After-Retry", after_retry)
    }

    /// Attach the build scan link, if one was found.
    pub fn with_build_scan(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self = self.with_entry(TAB_RUN_INFO, "Build-Scan", url.clone());
            self.build_scan_url = Some(url);
        }
        self
    }

    /// Record the wrapped command line.
    pub fn with_command(self, command: &str) -> Self {
        self.with_entry(TAB_RUN_INFO, "Command", command)
    }

    /// Attach CI metadata, app type and release stage.
    pub fn with_context(mut self, context: &CiContext) -> Self {
        self.app_type.clone_from(&context.step_key);
        self.release_stage = context.release_stage();

        let fields = [
            ("Job-ID", &context.job_id),
            ("ID", &context.build_id),
            ("URL", &context.build_url),
            ("Step-Key", &context.step_key),
            ("CI-Command", &context.command),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                self = self.with_entry(TAB_CI, key, value.as_str());
            }
        }
        self
    }

    /// Attach host details.
    pub fn with_device_info(self) -> Self {
        let version = self.app_version.clone();
        self.with_entry(TAB_DEVICE, "OS", std::env::consts::OS)
            .with_entry(TAB_DEVICE, "Arch", std::env::consts::ARCH)
            .with_entry(TAB_DEVICE, "Shellsentry", version)
    }

    /// Set a single metadata entry.
    pub fn with_entry(mut self, tab: &str, key: &str, value: impl Into<Value>) -> Self {
        self.metadata
            .entry(tab.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    /// Look up a metadata entry.
    pub fn entry(&self, tab: &str, key: &str) -> Option<&Value> {
        self.metadata.get(tab).and_then(|t| t.get(key))
    }
}
