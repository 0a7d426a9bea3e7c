//! shellsentry - CI command wrapper
//!
//! Main entry point for the `shellsentry` binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::WrapErr;
use shellsentry::executor::StdoutSink;
use shellsentry::{
    BugsnagReporter, DisabledReporter, ExecutorError, FailureReporter, OrchestratorError, Outcome,
    RetryOrchestrator, Settings,
};
use shellsentry_core::{CiContext, Config, ConfigError, IssueCatalog};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Configuration could not be loaded (sysexits EX_CONFIG).
const EXIT_CONFIG: i32 = 78;
/// The command could not be started (sysexits EX_OSERR).
const EXIT_SPAWN: i32 = 71;
/// Interrupted by SIGINT/SIGTERM.
const EXIT_CANCELLED: i32 = 130;
/// Unexpected internal failure.
const EXIT_INTERNAL: i32 = 70;

#[derive(Parser)]
#[command(
    name = "shellsentry",
    about = "Run a CI command, report known failures and retry transient ones",
    version
)]
struct Cli {
    /// Directory to run the command in; logs go to <dir>/tmp/shellsentry
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Bugsnag API key; reporting is disabled without one
    #[arg(long, env = "PE_BUGSNAG_KEY", hide_env_values = true)]
    bugsnag_key: Option<String>,

    /// JSON configuration file
    #[arg(long, env = "PE_CONFIGURATION_FILE")]
    config: Option<PathBuf>,

    /// Keep command logs after the run
    #[arg(short, long)]
    debug: bool,

    /// Command to run, joined with spaces
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "shellsentry=debug,shellsentry_core=debug,info"
    } else {
        "info"
    };
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:?}");
            EXIT_INTERNAL
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> eyre::Result<i32> {
    let (config, catalog) = match load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return Ok(EXIT_CONFIG);
        }
    };

    let command = cli.args.join(" ");
    let mut settings = Settings::new(&cli.project_dir, command);
    settings.debug = cli.debug;
    settings.gradle_enterprise_server = config.gradle_enterprise_server.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let cancel_token = CancellationToken::new();
        spawn_signal_handler(cancel_token.clone())?;

        let orchestrator = RetryOrchestrator::new(
            settings,
            catalog,
            CiContext::from_env(),
            reporter(cli.bugsnag_key.as_deref()),
        )
        .with_cancel_token(cancel_token);

        info!(
            command = %orchestrator.settings().command,
            working_dir = %orchestrator.settings().working_dir.display(),
            issues = config.resolved_issues().len(),
            "shellsentry starting"
        );

        let result = orchestrator.run(&mut StdoutSink).await;
        let code = exit_code_for(&result);
        if let Err(err) = &result {
            match code {
                EXIT_CANCELLED => warn!("cancelled"),
                EXIT_SPAWN => error!(error = %err, "failed to start command"),
                _ => error!(error = %err, "command run failed"),
            }
        }
        Ok::<_, eyre::Report>(code)
    })
}

/// Load the configuration file (if any) and build its issue catalog.
fn load_config(path: Option<&Path>) -> Result<(Config, IssueCatalog), ConfigError> {
    let config = Config::load(path)?;
    let catalog = config.catalog()?;
    Ok((config, catalog))
}

/// Process exit code for a finished orchestrator run.
fn exit_code_for(result: &Result<Outcome, OrchestratorError>) -> i32 {
    match result {
        Ok(outcome) => outcome.exit_code,
        Err(err) if err.is_cancelled() => EXIT_CANCELLED,
        Err(OrchestratorError::Executor(ExecutorError::Spawn { .. })) => EXIT_SPAWN,
        Err(_) => EXIT_INTERNAL,
    }
}

fn reporter(api_key: Option<&str>) -> Arc<dyn FailureReporter> {
    let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) else {
        info!("no bugsnag key; failure reporting disabled");
        return Arc::new(DisabledReporter);
    };
    match BugsnagReporter::new(key) {
        Ok(reporter) => Arc::new(reporter),
        Err(err) => {
            warn!(error = %err, "failed to set up bugsnag; failure reporting disabled");
            Arc::new(DisabledReporter)
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> eyre::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, stopping command"),
                _ = sigterm.recv() => info!("received SIGTERM, stopping command"),
            }
            token.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, stopping command");
            token.cancel();
        }
    });

    Ok(())
}
