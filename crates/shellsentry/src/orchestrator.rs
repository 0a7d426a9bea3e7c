//! Retry orchestration.
//!
//! Runs the wrapped command, classifies a failed run's log against the issue
//! catalog, reports known issues, and retries at most once:
//!
//! ```text
//! Running -> Evaluating -> Done
//!                       -> Retrying -> Running -> Evaluating -> Done
//! ```
//!
//! The second evaluation only reports; it never schedules another run.

use crate::executor::{CommandExecutor, ExecutionResult, ExecutorError, OutputSink};
use crate::reporter::FailureReporter;
use shellsentry_core::{
    find_build_scan_url, scan_log_file, CiContext, FailureReport, IssueCatalog, RetrySignal,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Log directory, relative to the project directory.
pub const LOG_DIR: &str = "tmp/shellsentry";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("failed to read command log: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

impl OrchestratorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Executor(ExecutorError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Per-invocation settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory the command runs in.
    pub working_dir: PathBuf,
    /// Where command logs are written.
    pub log_dir: PathBuf,
    /// Command line handed to the shell.
    pub command: String,
    /// Keep command logs after the run.
    pub debug: bool,
    /// Gradle Enterprise server that build scan links point at.
    pub gradle_enterprise_server: Option<String>,
}

impl Settings {
    pub fn new(project_dir: &Path, command: impl Into<String>) -> Self {
        Self {
            working_dir: project_dir.to_path_buf(),
            log_dir: project_dir.join(LOG_DIR),
            command: command.into(),
            debug: false,
            gradle_enterprise_server: None,
        }
    }
}

/// Summary of a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Exit code of the last run.
    pub exit_code: i32,
    /// Number of times the command ran (1 or 2).
    pub attempts: u32,
    /// Signal from each evaluated failure, in order.
    pub signals: Vec<RetrySignal>,
}

/// Drives a command through run, classification, reporting and retry.
pub struct RetryOrchestrator {
    settings: Settings,
    catalog: IssueCatalog,
    context: CiContext,
    reporter: Arc<dyn FailureReporter>,
    executor: CommandExecutor,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for RetryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("settings", &self.settings)
            .field("catalog_len", &self.catalog.len())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl RetryOrchestrator {
    pub fn new(
        settings: Settings,
        catalog: IssueCatalog,
        context: CiContext,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            settings,
            catalog,
            context,
            reporter,
            executor: CommandExecutor::with_defaults(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_executor(mut self, executor: CommandExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Token that aborts the active command or a pending retry delay.
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run the command to completion, retrying once if a known issue allows it.
    ///
    /// The log directory is removed afterwards unless `debug` is set, whether
    /// or not the run succeeded.
    pub async fn run(&self, sink: &mut dyn OutputSink) -> Result<Outcome> {
        let result = self.run_inner(sink).await;
        self.cleanup();
        if let Ok(outcome) = &result {
            info!(
                exit_code = outcome.exit_code,
                attempts = outcome.attempts,
                "shellsentry finished"
            );
        }
        result
    }

    async fn run_inner(&self, sink: &mut dyn OutputSink) -> Result<Outcome> {
        let first = self.execute(sink).await?;
        let mut outcome = Outcome {
            exit_code: first.exit_code,
            attempts: 1,
            signals: Vec::new(),
        };
        if first.succeeded() {
            return Ok(outcome);
        }

        let signal = self.evaluate(&first, false).await?;
        outcome.signals.push(signal.clone());

        match &signal {
            RetrySignal::Unknown => {
                info!(exit_code = first.exit_code, "no known issue matched; not retrying");
                return Ok(outcome);
            }
            RetrySignal::Ack(issue) => {
                info!(
                    grouping_hash = %issue.grouping_hash,
                    exit_code = first.exit_code,
                    "known issue is not retryable"
                );
                return Ok(outcome);
            }
            RetrySignal::RetryImmediately(issue) => {
                info!(grouping_hash = %issue.grouping_hash, "retrying immediately");
            }
            RetrySignal::RetryDelayed { issue, delay } => {
                info!(
                    grouping_hash = %issue.grouping_hash,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after delay"
                );
                tokio::select! {
                    () = tokio::time::sleep(*delay) => {}
                    () = self.cancel_token.cancelled() => {
                        info!("cancellation requested during retry delay");
                        return Err(OrchestratorError::Cancelled);
                    }
                }
            }
        }

        let retry = self.execute(sink).await?;
        outcome.attempts = 2;
        outcome.exit_code = retry.exit_code;
        if !retry.succeeded() {
            let signal = self.evaluate(&retry, true).await?;
            outcome.signals.push(signal);
        }
        Ok(outcome)
    }

    async fn execute(&self, sink: &mut dyn OutputSink) -> Result<ExecutionResult> {
        let result = self
            .executor
            .execute(
                &self.settings.working_dir,
                &self.settings.command,
                &self.settings.log_dir,
                sink,
                self.cancel_token.clone(),
            )
            .await?;
        Ok(result)
    }

    /// Classify a failed run and report the matched issue, if any.
    async fn evaluate(&self, result: &ExecutionResult, after_retry: bool) -> Result<RetrySignal> {
        let scan = scan_log_file(&result.log_file, &self.catalog)?;
        let signal = scan.signal;

        let Some(issue) = signal.issue() else {
            debug!(after_retry, "failure did not match any known issue");
            return Ok(signal);
        };

        warn!(
            grouping_hash = %issue.grouping_hash,
            signal = %signal,
            after_retry,
            "{}",
            issue.log_message
        );

        let build_scan = find_build_scan_url(
            &scan.lines_reversed,
            self.settings.gradle_enterprise_server.as_deref(),
        );
        let report = FailureReport::new(issue, &signal)
            .with_after_retry(after_retry)
            .with_build_scan(build_scan)
            .with_command(&self.settings.command)
            .with_context(&self.context)
            .with_device_info();

        if let Err(err) = self.reporter.report(&report).await {
            warn!(
                grouping_hash = %issue.grouping_hash,
                error = %err,
                "failed to deliver failure report"
            );
        }

        Ok(signal)
    }

    fn cleanup(&self) {
        let log_dir = &self.settings.log_dir;
        if self.settings.debug {
            info!(log_dir = %log_dir.display(), "debug mode; keeping command logs");
            return;
        }
        match std::fs::remove_dir_all(log_dir) {
            Ok(()) => debug!(log_dir = %log_dir.display(), "removed command logs"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                log_dir = %log_dir.display(),
                error = %err,
                "failed to remove command logs"
            ),
        }
    }
}
