//! Process Supervisor
//!
//! Runs one [`WorkerJob`] in a separate worker process and turns its message
//! stream into a [`RunOutcome`]:
//!
//! - The worker is spawned as the leader of a new process group, receives the
//!   job as JSON on stdin and answers with protocol lines on stdout.
//! - The stream is polled with a bounded timeout; on every timeout the worker's
//!   liveness is checked, so a worker that dies without a final message is
//!   reported as crashed instead of hanging the run.
//! - Cancellation signals the whole process group with SIGTERM, waits for a
//!   grace period, then escalates to SIGKILL. A cancelled run is reported as
//!   [`RunOutcome::Cancelled`], never as a crash.
//!
//! The worker is always reaped before the outcome is returned.

use crate::protocol::{decode, ExecutionMessage, LogLevel};
use crate::worker::WorkerJob;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// Buffered protocol lines between the reader task and the supervisor
const LINE_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to locate worker executable: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to serialize job: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Worker process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("Supervisor already ran a job")]
    AlreadyStarted,
}

/// Timing of the streaming loop and of cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Longest wait for a message before checking the worker is alive
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL on cancellation
    pub grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Program and arguments that start a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(OsString::from).collect(),
        }
    }

    /// This executable's hidden `worker` subcommand
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;
        Ok(Self::new(program, &["worker"]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Spawning,
    Streaming,
    Completed,
    Errored,
    Crashed,
    Cancelled,
}

/// How a supervised run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        success_count: usize,
        error_count: usize,
    },
    /// The worker reported a fatal error
    Errored { message: String },
    /// The worker exited without a final message
    Crashed { message: String },
    Cancelled,
}

impl RunOutcome {
    pub fn state(&self) -> SupervisorState {
        match self {
            RunOutcome::Completed { .. } => SupervisorState::Completed,
            RunOutcome::Errored { .. } => SupervisorState::Errored,
            RunOutcome::Crashed { .. } => SupervisorState::Crashed,
            RunOutcome::Cancelled => SupervisorState::Cancelled,
        }
    }

    /// Completed with no failed job
    pub fn is_clean(&self) -> bool {
        matches!(self, RunOutcome::Completed { error_count: 0, .. })
    }
}

/// Receives the non-terminal messages of a run as they arrive
pub trait SupervisorObserver: Send {
    fn on_progress(&mut self, _index: usize, _total: usize) {}

    fn on_log(&mut self, _level: LogLevel, _message: &str) {}

    fn on_job_complete(&mut self, _index: usize, _success: bool, _message: &str) {}
}

impl SupervisorObserver for () {}

/// Requests cancellation of a running supervisor from any task
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// A spawned worker and the channel its stdout lines arrive on
struct WorkerSession {
    child: Child,
    /// Process group id; the worker leads its own group
    group: Option<i32>,
    lines: mpsc::Receiver<String>,
    reader: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    command: WorkerCommand,
    config: SupervisorConfig,
    state: SupervisorState,
    cancel: CancelHandle,
    run_id: Uuid,
}

impl ProcessSupervisor {
    pub fn new(command: WorkerCommand, config: SupervisorConfig) -> Self {
        Self {
            command,
            config,
            state: SupervisorState::NotStarted,
            cancel: CancelHandle::default(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Start the worker on `job` and stream its messages to `observer` until
    /// the run ends. A supervisor runs at most one job.
    pub async fn run(
        &mut self,
        job: &WorkerJob,
        observer: &mut dyn SupervisorObserver,
    ) -> Result<RunOutcome, SupervisorError> {
        if self.state != SupervisorState::NotStarted {
            return Err(SupervisorError::AlreadyStarted);
        }
        let span = tracing::info_span!("supervisor", run_id = %self.run_id);

        self.state = SupervisorState::Spawning;
        let session = match self.start(job).instrument(span.clone()).await {
            Ok(session) => session,
            Err(e) => {
                self.state = SupervisorState::Errored;
                return Err(e);
            }
        };

        self.state = SupervisorState::Streaming;
        let outcome = self.stream(session, observer).instrument(span).await;
        self.state = outcome.state();
        Ok(outcome)
    }

    async fn start(&self, job: &WorkerJob) -> Result<WorkerSession, SupervisorError> {
        let payload = serde_json::to_vec(job)?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        let group = child.id().and_then(|id| i32::try_from(id).ok());
        tracing::info!(pid = ?group, program = %self.command.program.display(), "Worker started");

        let mut stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;

        // A worker that dies before reading its job shows up as a crash
        if let Err(e) = stdin.write_all(&payload).await {
            tracing::warn!(error = %e, "Failed to send job to worker");
        }
        drop(stdin);

        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        let reader = tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout).lines();
            loop {
                match stdout.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read worker output");
                        break;
                    }
                }
            }
        });

        Ok(WorkerSession {
            child,
            group,
            lines,
            reader,
        })
    }

    async fn stream(
        &self,
        mut session: WorkerSession,
        observer: &mut dyn SupervisorObserver,
    ) -> RunOutcome {
        let mut kill_deadline: Option<Instant> = None;
        let mut killed = false;

        let outcome = loop {
            if self.cancel.is_cancelled() && kill_deadline.is_none() {
                tracing::info!("Cancelling worker");
                signal_group(session.group, GroupSignal::Terminate);
                kill_deadline = Some(Instant::now() + self.config.grace_period);
            }
            if let Some(deadline) = kill_deadline {
                if !killed && Instant::now() >= deadline {
                    tracing::warn!("Worker ignored SIGTERM, killing process group");
                    signal_group(session.group, GroupSignal::Kill);
                    killed = true;
                }
            }
            let cancelling = kill_deadline.is_some();

            tokio::select! {
                _ = self.cancel.notify.notified(), if !cancelling => continue,
                received = timeout(self.config.poll_interval, session.lines.recv()) => match received {
                    Ok(Some(line)) => {
                        if let Some(outcome) = handle_line(&line, cancelling, observer) {
                            break outcome;
                        }
                    }
                    Ok(None) => break end_of_stream(cancelling, None),
                    Err(_) => {
                        match session.child.try_wait() {
                            Ok(Some(status)) => {
                                // Exited; take whatever it wrote before dying
                                if let Some(outcome) = self.drain_final(&mut session, cancelling, observer).await {
                                    break outcome;
                                }
                                break end_of_stream(cancelling, Some(status));
                            }
                            Ok(None) => {}
                            Err(e) => tracing::warn!(error = %e, "Failed to poll worker status"),
                        }
                    }
                },
            }
        };

        self.teardown(session, kill_deadline.is_some()).await;
        tracing::info!(?outcome, "Worker run finished");
        outcome
    }

    /// Read what an exited worker left in its pipe, up to and including a
    /// final message
    async fn drain_final(
        &self,
        session: &mut WorkerSession,
        cancelling: bool,
        observer: &mut dyn SupervisorObserver,
    ) -> Option<RunOutcome> {
        while let Ok(Some(line)) = timeout(self.config.poll_interval, session.lines.recv()).await {
            if let Some(outcome) = handle_line(&line, cancelling, observer) {
                return Some(outcome);
            }
        }
        None
    }

    /// Reap the worker; kill it and its group if it outlives the grace period
    async fn teardown(&self, mut session: WorkerSession, cancelled: bool) {
        session.lines.close();
        match timeout(self.config.grace_period, session.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "Worker exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for worker"),
            Err(_) => {
                tracing::warn!("Worker still running after the run ended, killing it");
                signal_group(session.group, GroupSignal::Kill);
                if let Err(e) = session.child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill worker");
                }
            }
        }
        if cancelled {
            // Tools that outlived the worker
            signal_group(session.group, GroupSignal::Kill);
        }
        session.reader.abort();
    }
}

fn end_of_stream(cancelling: bool, status: Option<ExitStatus>) -> RunOutcome {
    if cancelling {
        return RunOutcome::Cancelled;
    }
    let message = match status {
        Some(status) => format!("Process terminated unexpectedly ({})", status),
        None => "Process terminated unexpectedly".to_string(),
    };
    tracing::error!(%message, "Worker crashed");
    RunOutcome::Crashed { message }
}

/// Forward one protocol line; returns the outcome once a final message arrives
fn handle_line(
    line: &str,
    cancelling: bool,
    observer: &mut dyn SupervisorObserver,
) -> Option<RunOutcome> {
    if line.trim().is_empty() {
        return None;
    }
    let message = match decode(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, line, "Ignoring unreadable worker output");
            return None;
        }
    };

    if cancelling {
        // Only the cleanup notices still matter
        return match message {
            ExecutionMessage::Log { level, message } => {
                observer.on_log(level, &message);
                None
            }
            message if message.is_terminal() => Some(RunOutcome::Cancelled),
            _ => None,
        };
    }

    match message {
        ExecutionMessage::Progress { index, total } => {
            observer.on_progress(index, total);
            None
        }
        ExecutionMessage::Log { level, message } => {
            observer.on_log(level, &message);
            None
        }
        ExecutionMessage::JobComplete {
            index,
            success,
            message,
        } => {
            observer.on_job_complete(index, success, &message);
            None
        }
        ExecutionMessage::Complete {
            success_count,
            error_count,
        } => Some(RunOutcome::Completed {
            success_count,
            error_count,
        }),
        ExecutionMessage::Error { message } => Some(RunOutcome::Errored { message }),
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(group: Option<i32>, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(group) = group else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(group), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(error = %e, group, ?signal, "Failed to signal worker group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_group: Option<i32>, _signal: GroupSignal) {}
