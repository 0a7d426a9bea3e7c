//! Command execution with streamed log capture.
//!
//! Runs a command line through `sh -c` and drains stdout and stderr
//! concurrently. Every line is forwarded to an [`OutputSink`] and appended,
//! byte for byte, to a fresh `shellsentry*.txt` log file. Output is never held
//! in memory beyond the line currently in flight.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prefix of every log file created by the executor.
pub const LOG_FILE_PREFIX: &str = "shellsentry";
/// Suffix of every log file created by the executor.
pub const LOG_FILE_SUFFIX: &str = ".txt";

/// Lines buffered between the pipe readers and the log writer.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// How long a cancelled command gets to exit after SIGTERM before it is killed.
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long output is still collected after the shell itself has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn `{command}` in {}: {source}", .working_dir.display())]
    Spawn {
        command: String,
        working_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Receives each output line as it is produced, without its line terminator.
pub trait OutputSink: Send {
    fn emit(&mut self, line: &str);
}

impl<F> OutputSink for F
where
    F: FnMut(&str) + Send,
{
    fn emit(&mut self, line: &str) {
        self(line);
    }
}

/// Echoes command output to our own stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn emit(&mut self, line: &str) {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}").ok();
    }
}

/// Result of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code; `128 + signal` when the process was killed by a signal.
    pub exit_code: i32,
    /// Log file holding the combined output. Never deleted by the executor.
    pub log_file: PathBuf,
    pub duration_ms: u64,
    pub line_count: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Shell used to interpret the command line.
    pub shell: String,
    /// Grace period between SIGTERM and kill on cancellation.
    pub terminate_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

/// Runs shell command lines with output capture.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Execute `command_line` in `working_dir`, logging into `output_dir`.
    ///
    /// A non-zero exit is a normal result; only failing to start the process
    /// (or to write the log) is an error. If `cancel_token` fires, the
    /// command's process group is terminated and `Cancelled` is returned.
    pub async fn execute(
        &self,
        working_dir: &Path,
        command_line: &str,
        output_dir: &Path,
        sink: &mut dyn OutputSink,
        cancel_token: CancellationToken,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(command_line)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            command = command_line,
            working_dir = %working_dir.display(),
            "spawning command"
        );

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            command: command_line.to_string(),
            working_dir: working_dir.to_path_buf(),
            source,
        })?;

        let (log_file, file) = create_log_file(output_dir)?;
        let mut writer = BufWriter::new(tokio::fs::File::from_std(file));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;

        let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let readers = [
            tokio::spawn(forward_lines(stdout, tx.clone())),
            tokio::spawn(forward_lines(stderr, tx)),
        ];
        // `id()` is gone once the child is reaped.
        let pgid = child.id();

        let mut line_count = 0u64;
        let mut exited = None;
        while exited.is_none() {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(bytes) => {
                        record(&mut writer, sink, &bytes).await?;
                        line_count += 1;
                    }
                    None => break,
                },
                status = child.wait() => exited = Some(status?),
                () = cancel_token.cancelled() => {
                    return self.abort(&mut child, &mut writer, &log_file).await;
                }
            }
        }

        let status = match exited {
            Some(status) => status,
            None => tokio::select! {
                status = child.wait() => status?,
                () = cancel_token.cancelled() => {
                    return self.abort(&mut child, &mut writer, &log_file).await;
                }
            },
        };

        // Background jobs left by the shell would otherwise hold the pipes open.
        kill_process_group(pgid);
        let drained = timeout(DRAIN_TIMEOUT, async {
            while let Some(bytes) = rx.recv().await {
                record(&mut writer, &mut *sink, &bytes).await?;
                line_count += 1;
            }
            Ok::<_, std::io::Error>(())
        })
        .await;
        match drained {
            Ok(result) => {
                result?;
                join_readers(readers).await;
            }
            Err(_) => {
                warn!(
                    timeout_ms = DRAIN_TIMEOUT.as_millis() as u64,
                    "output still open after command exited; dropping the rest"
                );
                for reader in &readers {
                    reader.abort();
                }
            }
        }
        writer.flush().await?;

        let exit_code = exit_code(status);
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            exit_code,
            duration_ms,
            lines = line_count,
            log_file = %log_file.display(),
            "command finished"
        );

        Ok(ExecutionResult {
            exit_code,
            log_file,
            duration_ms,
            line_count,
        })
    }

    /// Terminate a cancelled command, keeping whatever output was logged.
    async fn abort(
        &self,
        child: &mut Child,
        writer: &mut BufWriter<tokio::fs::File>,
        log_file: &Path,
    ) -> Result<ExecutionResult> {
        info!("cancellation requested; terminating command");
        terminate(child, self.config.terminate_grace).await;
        if let Err(err) = writer.flush().await {
            warn!(error = %err, log_file = %log_file.display(), "failed to flush partial log");
        }
        Err(ExecutorError::Cancelled)
    }
}

/// Create a uniquely named log file that outlives this process.
fn create_log_file(output_dir: &Path) -> std::io::Result<(PathBuf, std::fs::File)> {
    std::fs::create_dir_all(output_dir)?;
    let (file, path) = tempfile::Builder::new()
        .prefix(LOG_FILE_PREFIX)
        .suffix(LOG_FILE_SUFFIX)
        .tempfile_in(output_dir)?
        .keep()
        .map_err(|e| e.error)?;
    Ok((path, file))
}

/// Read raw lines (terminator included) and hand them to the writer loop.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<Vec<u8>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        if tx.send(line).await.is_err() {
            // Writer is gone (cancelled); stop draining.
            return Ok(());
        }
    }
}

async fn record(
    writer: &mut BufWriter<tokio::fs::File>,
    sink: &mut dyn OutputSink,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    sink.emit(strip_line_ending(&String::from_utf8_lossy(bytes)));
    Ok(())
}

async fn join_readers(readers: [JoinHandle<std::io::Result<()>>; 2]) {
    for reader in readers {
        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "output capture failed"),
            Err(err) => warn!(error = %err, "output reader task panicked"),
        }
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// SIGKILL whatever is left in the command's process group.
fn kill_process_group(pgid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) {
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => debug!(error = %err, "failed to kill leftover processes"),
            }
        }
    }

    #[cfg(not(unix))]
    let _ = pgid;
}

/// SIGTERM the command's process group, then kill whatever is left.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pgid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            let pgid = Pid::from_raw(pgid);
            if let Err(err) = killpg(pgid, Signal::SIGTERM) {
                debug!(error = %err, "failed to signal process group");
            }
            let exited = matches!(timeout(grace, child.wait()).await, Ok(Ok(_)));
            // The shell may be gone while its children still run.
            let _ = killpg(pgid, Signal::SIGKILL);
            if exited {
                return;
            }
        }
    }

    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill command");
    }
}
