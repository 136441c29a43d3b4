//! Worker Process
//!
//! Entry point of the background process the supervisor spawns. The worker
//! reads one [`WorkerJob`] as JSON from stdin, runs it sequentially, and
//! writes protocol messages to stdout, one JSON line each. Diagnostics go to
//! stderr through `tracing`.
//!
//! On SIGTERM or SIGINT the worker stops emitting results, logs a cleanup
//! notice, terminates its process group so running tools die with it, gives
//! the job a short window to roll back, and exits.

pub mod import;
pub mod pipeline;

pub use import::{run_import, ImportBatch, ImportJob};
pub use pipeline::{run_pipeline, PipelineJob};

use crate::protocol::{encode, ExecutionMessage, LogLevel, MessageSink};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// How long a cancelled job may keep running to roll back its stage
const CLEANUP_WINDOW: Duration = Duration::from_secs(2);

/// Exit code after SIGTERM (128 + 15)
pub const EXIT_TERMINATED: i32 = 143;

/// Exit code after SIGINT (128 + 2)
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to read job from stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// A unit of work handed to the worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum WorkerJob {
    Pipeline(PipelineJob),
    Import(ImportBatch),
}

impl WorkerJob {
    pub fn run(&self, sink: &dyn MessageSink) {
        match self {
            WorkerJob::Pipeline(job) => run_pipeline(job, sink),
            WorkerJob::Import(batch) => run_import(batch, sink),
        }
    }
}

/// Writes messages to stdout as JSON lines.
///
/// Once cancelled, only `Log` messages still go out, so a stopped run never
/// reports completion.
#[derive(Default)]
pub struct StdoutSink {
    cancelled: AtomicBool,
}

impl StdoutSink {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl MessageSink for StdoutSink {
    fn send(&self, message: ExecutionMessage) {
        if self.is_cancelled() && !matches!(message, ExecutionMessage::Log { .. }) {
            tracing::debug!(?message, "Dropping message after cancellation");
            return;
        }

        let line = match encode(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode message");
                return;
            }
        };

        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
            // Supervisor went away; nothing left to report to
            tracing::debug!(error = %e, "Failed to write message");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Read the job, run it, and return the process exit code
pub async fn run_from_stdio() -> Result<i32, WorkerError> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .map_err(WorkerError::Stdin)?;

    let sink = Arc::new(StdoutSink::default());

    let job: WorkerJob = match serde_json::from_str(&input) {
        Ok(job) => job,
        Err(e) => {
            sink.send(ExecutionMessage::Error {
                message: format!("Invalid job description: {}", e),
            });
            return Ok(1);
        }
    };

    let mut termination = Box::pin(termination_signal()?);

    let job_sink = Arc::clone(&sink);
    let mut task = tokio::task::spawn_blocking(move || job.run(job_sink.as_ref()));

    tokio::select! {
        result = &mut task => match result {
            Ok(()) => Ok(0),
            Err(e) => {
                tracing::error!(error = %e, "Job task failed");
                sink.send(ExecutionMessage::Error {
                    message: format!("Worker job aborted: {}", e),
                });
                Ok(1)
            }
        },
        code = &mut termination => {
            sink.cancel();
            sink.log(LogLevel::Warning, "Cancellation requested, stopping running tools and cleaning up");
            terminate_process_group();
            if tokio::time::timeout(CLEANUP_WINDOW, task).await.is_err() {
                tracing::warn!("Job did not stop within the cleanup window");
            }
            Ok(code)
        }
    }
}

/// Resolves with the exit code matching the first termination signal
#[cfg(unix)]
fn termination_signal() -> Result<impl std::future::Future<Output = i32>, WorkerError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).map_err(WorkerError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(WorkerError::Signal)?;
    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => EXIT_TERMINATED,
            _ = sigint.recv() => EXIT_INTERRUPTED,
        }
    })
}

#[cfg(not(unix))]
fn termination_signal() -> Result<impl std::future::Future<Output = i32>, WorkerError> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        EXIT_INTERRUPTED
    })
}

/// SIGTERM every process in our group (running tools included).
///
/// Only done when this process leads its group, which is how the supervisor
/// spawns it; otherwise the group belongs to someone else.
#[cfg(unix)]
fn terminate_process_group() {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::{getpgrp, getpid};

    let group = getpgrp();
    if group != getpid() {
        tracing::debug!("Not a process group leader, leaving group alone");
        return;
    }
    // Our own SIGTERM handler is still installed, so this does not kill us
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        tracing::warn!(error = %e, "Failed to signal process group");
    }
}

#[cfg(not(unix))]
fn terminate_process_group() {}
