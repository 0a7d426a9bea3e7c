//! shellsentry - CI command wrapper
//!
//! Runs a build command, recognizes known flaky failures in its output,
//! reports them, and retries once when the failure is known to be transient.

pub mod executor;
pub mod orchestrator;
pub mod reporter;

pub use executor::{CommandExecutor, ExecutionResult, ExecutorConfig, ExecutorError, OutputSink};
pub use orchestrator::{OrchestratorError, Outcome, RetryOrchestrator, Settings};
pub use reporter::{BugsnagReporter, DisabledReporter, FailureReporter, ReportError};
