//! Shared test fixtures: recording sink and fake external tools.

use crate::config::ToolConfig;
use crate::protocol::{ExecutionMessage, LogLevel, MessageSink};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Sink that keeps every message for assertions
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<ExecutionMessage>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<ExecutionMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn logs(&self, level: LogLevel) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                ExecutionMessage::Log { level: l, message } if l == level => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl MessageSink for RecordingSink {
    fn send(&self, message: ExecutionMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Write an executable `sh` script named `name` into `bin_dir`
pub fn fake_tool(bin_dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(bin_dir).unwrap();
    let path = bin_dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    #[cfg(unix)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Fake tool that creates `<last argument>.nii.gz` and exits 0
pub const WRITES_LAST_ARG: &str = r#"for last; do :; done
: > "$last.nii.gz""#;

/// Fake tool that creates the file named after `flag`, adding `.nii.gz`
/// when the value carries no image extension
pub fn writes_flag(flag: &str) -> String {
    format!(
        r#"out=""
while [ $# -gt 0 ]; do
  [ "$1" = "{flag}" ] && out="$2"
  shift
done
case "$out" in
  *.nii|*.nii.gz) : > "$out" ;;
  *) : > "$out.nii.gz" ;;
esac"#
    )
}

/// Fake tool that always fails with a message on stderr
pub const ALWAYS_FAILS: &str = r#"echo "simulated failure" >&2
exit 2"#;

/// FSL install rooted at `root` with the given fake tools in `root/bin`
pub fn fake_fsl(root: &Path, tools: &[(&str, &str)]) -> ToolConfig {
    for (name, body) in tools {
        fake_tool(&root.join("bin"), name, body);
    }
    ToolConfig::with_fsl_dir(root)
}
