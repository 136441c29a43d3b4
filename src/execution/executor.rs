//! Operation Executor
//!
//! Runs one pipeline operation: enters its working directory, resolves its
//! files, and launches the fixed tool command for its kind.

use super::commands::{build_invocations, CommandError, ResolvedFiles, ToolInvocation};
use super::resolver::{FileResolver, Resolution};
use crate::config::{Operation, OperationKind, ToolConfig};
use crate::subject::Subject;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Longest stderr excerpt carried by a failure
const STDERR_SUMMARY_LIMIT: usize = 600;

/// The process working directory is global; only one guard may hold it.
static WORKDIR_LOCK: Mutex<()> = Mutex::new(());

/// Outcome of a single operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// All tool invocations ran and succeeded
    Completed,
    /// Operation was skipped (includes reason)
    Skipped(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Working directory '{0}' not found in subject tree")]
    WorkdirNotFound(String),
    #[error("Failed to enter working directory {path}: {source}")]
    WorkdirChange {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Operation '{kind}' expects {expected} files, got {found}")]
    Arity {
        kind: OperationKind,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Template(#[from] CommandError),
    #[error("Failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} failed with {}: {stderr}", exit_label(.code))]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

impl ExecutionError {
    /// Tool responsible for the failure, when one was launched
    pub fn tool(&self) -> Option<&str> {
        match self {
            ExecutionError::Launch { tool, .. } | ExecutionError::ToolFailed { tool, .. } => {
                Some(tool)
            }
            _ => None,
        }
    }
}

/// Holds the process working directory for the duration of an operation and
/// restores the previous one on drop.
pub struct WorkdirGuard {
    previous: Option<PathBuf>,
    _lock: MutexGuard<'static, ()>,
}

impl WorkdirGuard {
    pub fn enter(path: &Path) -> Result<Self, ExecutionError> {
        let lock = WORKDIR_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = env::current_dir().ok();
        env::set_current_dir(path).map_err(|source| ExecutionError::WorkdirChange {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::trace!(path = %path.display(), "Entered working directory");
        Ok(Self {
            previous,
            _lock: lock,
        })
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if let Some(previous) = &self.previous {
            if let Err(e) = env::set_current_dir(previous) {
                tracing::warn!(path = %previous.display(), error = %e, "Failed to restore working directory");
            }
        }
    }
}

/// Executes operations for one subject
pub struct OperationExecutor<'a> {
    subject: &'a Subject,
    tools: &'a ToolConfig,
}

impl<'a> OperationExecutor<'a> {
    pub fn new(subject: &'a Subject, tools: &'a ToolConfig) -> Self {
        Self { subject, tools }
    }

    /// Run one operation.
    ///
    /// Operations run in their `workdir` folder, or in the subject root when
    /// none is set. An input that cannot be found skips the operation; a tool
    /// exiting non-zero fails it, except for viewers.
    pub fn execute(&self, operation: &Operation) -> Result<OperationOutcome, ExecutionError> {
        let expected = operation.kind.file_count();
        if operation.files.len() != expected {
            return Err(ExecutionError::Arity {
                kind: operation.kind,
                expected,
                found: operation.files.len(),
            });
        }

        let resolver = FileResolver::new(self.subject);
        let workdir = match operation.workdir.as_deref() {
            Some(suffix) => resolver
                .workdir(suffix)
                .ok_or_else(|| ExecutionError::WorkdirNotFound(suffix.to_string()))?,
            None => self.subject.root().to_path_buf(),
        };
        let _guard = WorkdirGuard::enter(&workdir)?;

        let mut inputs = Vec::with_capacity(operation.inputs().len());
        for template in operation.inputs() {
            match resolver.resolve(template, operation.workdir.as_deref()) {
                Resolution::Found(path) => inputs.push(path),
                Resolution::NotFound { pattern } => {
                    let reason = format!("Input file {} does not exist", pattern);
                    tracing::warn!(operation = %operation.kind, subject = %self.subject.name(), "{}", reason);
                    return Ok(OperationOutcome::Skipped(reason));
                }
            }
        }
        let output = operation.output().map(|template| resolver.output(template));

        tracing::debug!(
            operation = %operation.kind,
            workdir = %workdir.display(),
            inputs = ?inputs,
            output = ?output,
            "Executing operation"
        );

        if operation.kind == OperationKind::Reconstruct {
            if let Some(output) = &output {
                clear_previous_reconstruction(&workdir.join(output));
            }
        }

        let files = ResolvedFiles {
            inputs: &inputs,
            output: output.as_deref(),
        };
        for invocation in build_invocations(operation.kind, &files, self.tools)? {
            match run_tool(&invocation, &workdir) {
                Ok(()) => {}
                Err(e) if operation.kind.is_viewer() => {
                    tracing::warn!(tool = invocation.tool, error = %e, "Viewer exited abnormally");
                    return Ok(OperationOutcome::Completed);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(OperationOutcome::Completed)
    }
}

/// A fresh `recon-all` refuses to overwrite an existing subject directory
fn clear_previous_reconstruction(path: &Path) {
    if path.is_dir() {
        match fs::remove_dir_all(path) {
            Ok(()) => tracing::info!(path = %path.display(), "Removed previous reconstruction"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove previous reconstruction")
            }
        }
    }
}

/// Launch one tool and wait for it. Stdout never reaches the worker's own
/// stdout, which carries protocol messages.
pub(crate) fn run_tool(invocation: &ToolInvocation, workdir: &Path) -> Result<(), ExecutionError> {
    tracing::info!(tool = invocation.tool, command = %invocation.display(), "Running tool");

    // A string program keeps bare names on PATH; duct would run a one-part
    // PathBuf from the working directory
    let program = invocation.program.as_os_str().to_owned();
    let mut expression = duct::cmd(program, &invocation.args)
        .dir(workdir)
        .stdin_null()
        .stderr_capture()
        .unchecked();
    expression = if invocation.quiet {
        expression.stdout_null()
    } else {
        expression.stdout_capture()
    };

    let output = expression.run().map_err(|source| ExecutionError::Launch {
        tool: invocation.tool.to_string(),
        source,
    })?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        tracing::debug!(tool = invocation.tool, "{}", line);
    }

    if output.status.success() {
        Ok(())
    } else {
        Err(ExecutionError::ToolFailed {
            tool: invocation.tool.to_string(),
            code: output.status.code(),
            stderr: summarize_stderr(&output.stderr),
        })
    }
}

fn summarize_stderr(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = lines[lines.len().saturating_sub(5)..].join(" | ");
    if tail.len() > STDERR_SUMMARY_LIMIT {
        let mut cut = tail.len() - STDERR_SUMMARY_LIMIT;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        format!("...{}", &tail[cut..])
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_fsl, ALWAYS_FAILS, WRITES_LAST_ARG};
    use tempfile::tempdir;

    fn subject_with_ct(root: &Path) -> Subject {
        let subject = Subject::create(root, "S").unwrap();
        fs::write(subject.processed_tmp().join("S_CT.nii.gz"), b"x").unwrap();
        subject
    }

    #[test]
    fn test_execute_crop_in_workdir() {
        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = fake_fsl(&dir.path().join("fsl"), &[("robustfov", WRITES_LAST_ARG)]);

        let operation = Operation::new(
            OperationKind::Crop,
            Some("processed_tmp"),
            &["${name}_CT", "${name}_CT_C"],
        );
        let outcome = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap();

        assert_eq!(outcome, OperationOutcome::Completed);
        assert!(subject.processed_tmp().join("S_CT_C.nii.gz").exists());
    }

    #[test]
    fn test_missing_input_skips_without_error() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "S").unwrap();
        let tools = fake_fsl(&dir.path().join("fsl"), &[("robustfov", ALWAYS_FAILS)]);

        let operation = Operation::new(OperationKind::Crop, None, &["${name}_CT", "${name}_CT_C"]);
        let outcome = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap();

        assert!(matches!(outcome, OperationOutcome::Skipped(reason) if reason.contains("S_CT")));
    }

    #[test]
    fn test_tool_failure_carries_tool_and_stderr() {
        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = fake_fsl(&dir.path().join("fsl"), &[("fslmaths", ALWAYS_FAILS)]);

        let operation = Operation::new(OperationKind::Threshold, None, &["${name}_CT", "${name}_thr"]);
        let err = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap_err();

        match err {
            ExecutionError::ToolFailed { tool, code, stderr } => {
                assert_eq!(tool, "fslmaths");
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "simulated failure");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_launch_failure_for_missing_program() {
        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = ToolConfig::with_fsl_dir(dir.path().join("no-fsl"));

        let operation = Operation::new(OperationKind::Crop, None, &["${name}_CT", "${name}_C"]);
        let err = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap_err();
        assert!(matches!(err, ExecutionError::Launch { .. }));
        assert_eq!(err.tool(), Some("robustfov"));
    }

    #[test]
    fn test_viewer_failure_does_not_fail() {
        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = fake_fsl(&dir.path().join("fsl"), &[("fsleyes", ALWAYS_FAILS)]);

        let operation = Operation::new(OperationKind::OpenFsleyes, None, &["${name}_CT"]);
        let outcome = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap();
        assert_eq!(outcome, OperationOutcome::Completed);
    }

    #[test]
    fn test_arity_mismatch() {
        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = ToolConfig::default();

        let operation = Operation::new(OperationKind::Coregister, None, &["${name}_CT", "${name}_reg"]);
        let err = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap_err();
        assert!(matches!(err, ExecutionError::Arity { expected: 3, found: 2, .. }));
    }

    #[test]
    fn test_unknown_workdir() {
        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = ToolConfig::default();

        let operation = Operation::new(OperationKind::Move, Some("nowhere"), &["${name}_CT", "x"]);
        let err = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap_err();
        assert!(matches!(err, ExecutionError::WorkdirNotFound(s) if s == "nowhere"));
    }

    #[test]
    fn test_copy_overwrites_existing_destination() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = ToolConfig::default();
        let existing = subject.pipeline_output().join("S_CT.nii.gz");
        fs::write(&existing, b"stale").unwrap();
        fs::set_permissions(&existing, fs::Permissions::from_mode(0o444)).unwrap();

        let operation = Operation::new(
            OperationKind::Copy,
            Some("processed_tmp"),
            &["${name}_CT", "${subj_dir}/pipeline_output"],
        );
        let outcome = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap();

        assert_eq!(outcome, OperationOutcome::Completed);
        assert_eq!(fs::read(&existing).unwrap(), b"x");
        assert!(subject.processed_tmp().join("S_CT.nii.gz").exists());
    }

    #[test]
    fn test_relative_subject_root_still_resolves() {
        let dir = tempdir().unwrap();
        subject_with_ct(dir.path());
        let tools = fake_fsl(&dir.path().join("fsl"), &[("robustfov", WRITES_LAST_ARG)]);

        let subject = {
            let _guard = WorkdirGuard::enter(dir.path()).unwrap();
            Subject::open("S").unwrap()
        };
        assert!(subject.root().is_absolute());
        assert_eq!(subject.root(), dir.path().join("S"));

        let operation = Operation::new(
            OperationKind::Crop,
            Some("processed_tmp"),
            &["${name}_CT", "${name}_CT_C"],
        );
        let outcome = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap();

        assert_eq!(outcome, OperationOutcome::Completed);
        assert!(subject.processed_tmp().join("S_CT_C.nii.gz").exists());
    }

    /// Working directory while no guard is active
    fn resting_dir() -> PathBuf {
        let _lock = WORKDIR_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        env::current_dir().unwrap()
    }

    #[test]
    fn test_guard_restores_directory_on_failure() {
        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = fake_fsl(&dir.path().join("fsl"), &[("fslmaths", ALWAYS_FAILS)]);

        let operation = Operation::new(
            OperationKind::Threshold,
            Some("processed_tmp"),
            &["${name}_CT", "${name}_thr"],
        );
        let before = resting_dir();
        assert!(OperationExecutor::new(&subject, &tools).execute(&operation).is_err());
        assert_eq!(resting_dir(), before);
    }

    #[test]
    fn test_move_uses_system_tool() {
        let dir = tempdir().unwrap();
        let subject = subject_with_ct(dir.path());
        let tools = ToolConfig::default();

        let operation = Operation::new(
            OperationKind::Move,
            Some("processed_tmp"),
            &["${name}_CT", "${subj_dir}/pipeline_output"],
        );
        let outcome = OperationExecutor::new(&subject, &tools).execute(&operation).unwrap();

        assert_eq!(outcome, OperationOutcome::Completed);
        assert!(subject.pipeline_output().join("S_CT.nii.gz").exists());
        assert!(!subject.processed_tmp().join("S_CT.nii.gz").exists());
    }

    #[test]
    fn test_summarize_stderr_keeps_tail() {
        let stderr = b"line1\n\nline2\nline3\nline4\nline5\nline6\n";
        assert_eq!(summarize_stderr(stderr), "line2 | line3 | line4 | line5 | line6");

        let long = "x".repeat(2000);
        let summary = summarize_stderr(long.as_bytes());
        assert!(summary.starts_with("..."));
        assert_eq!(summary.len(), STDERR_SUMMARY_LIMIT + 3);
    }
}
