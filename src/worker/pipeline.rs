//! Pipeline job: run a list of stages for a batch of subjects.

use crate::config::{PipelineConfig, Stage, ToolConfig};
use crate::execution::StageRunner;
use crate::protocol::{ExecutionMessage, LogLevel, MessageSink};
use crate::subject::Subject;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Work order for a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    /// Directory holding one folder per subject
    pub output_directory: PathBuf,
    /// Subject folder names, processed in order
    pub subjects: Vec<String>,
    /// Stage names to run in order; all configured stages when absent
    #[serde(default)]
    pub stages: Option<Vec<String>>,
    pub config: PipelineConfig,
    #[serde(default)]
    pub tools: ToolConfig,
}

impl PipelineJob {
    /// Stages this job runs, or the name of the first unknown one
    fn selected_stages(&self) -> Result<Vec<&Stage>, String> {
        match &self.stages {
            None => Ok(self.config.stages.iter().collect()),
            Some(names) => names
                .iter()
                .map(|name| self.config.stage(name).ok_or_else(|| name.clone()))
                .collect(),
        }
    }
}

/// Run every selected stage for every subject.
///
/// A subject stops at its first failed stage; the batch moves on to the next
/// subject. Ends with `Complete`, or `Error` when the job itself is unusable.
pub fn run_pipeline(job: &PipelineJob, sink: &dyn MessageSink) {
    if !job.output_directory.is_dir() {
        sink.send(ExecutionMessage::Error {
            message: format!(
                "Output directory {} does not exist",
                job.output_directory.display()
            ),
        });
        return;
    }

    if let Err(e) = job.config.validate() {
        sink.send(ExecutionMessage::Error {
            message: format!("Invalid pipeline configuration: {}", e),
        });
        return;
    }

    let stages = match job.selected_stages() {
        Ok(stages) => stages,
        Err(unknown) => {
            sink.send(ExecutionMessage::Error {
                message: format!("Unknown stage: {}", unknown),
            });
            return;
        }
    };

    let runner = StageRunner::new(&job.tools, sink);
    let total_steps = job.subjects.len() * stages.len();
    let mut completed_steps = 0;
    let mut success_count = 0;
    let mut error_count = 0;

    tracing::info!(
        subjects = job.subjects.len(),
        stages = stages.len(),
        "Starting pipeline run"
    );

    for (position, name) in job.subjects.iter().enumerate() {
        let index = position + 1;
        if sink.is_cancelled() {
            tracing::info!(subject = %name, "Run cancelled before subject");
            break;
        }

        let subject = match Subject::open(job.output_directory.join(name)) {
            Ok(subject) => subject,
            Err(e) => {
                let message = format!("Subject {} could not be opened: {}", name, e);
                sink.log(LogLevel::Error, &message);
                sink.send(ExecutionMessage::JobComplete {
                    index,
                    success: false,
                    message,
                });
                error_count += 1;
                completed_steps += stages.len();
                sink.send(ExecutionMessage::Progress {
                    index: completed_steps,
                    total: total_steps,
                });
                continue;
            }
        };

        sink.log(LogLevel::Info, &format!("Processing subject {}...", name));

        // A full run starts from an empty scratch area
        if stages.len() > 1 {
            if let Err(e) = subject.clear_processed_tmp() {
                sink.log(
                    LogLevel::Warning,
                    &format!("Could not clear processed_tmp for {}: {}", name, e),
                );
            }
        }

        let mut failed_stage: Option<&str> = None;
        for (done, stage) in stages.iter().enumerate() {
            if sink.is_cancelled() {
                failed_stage = Some(stage.name.as_str());
                completed_steps += stages.len() - done;
                break;
            }

            sink.log(
                LogLevel::Info,
                &format!("Running stage {} for subject {}...", stage.name, name),
            );
            let succeeded = runner.run(stage, &subject, &job.config, stages.len());
            completed_steps += 1;

            if !succeeded {
                failed_stage = Some(stage.name.as_str());
                // Remaining stages of this subject count as done for progress
                completed_steps += stages.len() - done - 1;
                sink.send(ExecutionMessage::Progress {
                    index: completed_steps,
                    total: total_steps,
                });
                break;
            }

            sink.send(ExecutionMessage::Progress {
                index: completed_steps,
                total: total_steps,
            });
        }

        let (success, message) = match failed_stage {
            None => {
                success_count += 1;
                (true, format!("{}: all stages completed", name))
            }
            Some(stage) => {
                error_count += 1;
                (false, format!("{}: stage '{}' failed", name, stage))
            }
        };
        sink.log(
            if success { LogLevel::Success } else { LogLevel::Error },
            &message,
        );
        sink.send(ExecutionMessage::JobComplete {
            index,
            success,
            message,
        });
    }

    sink.log(
        LogLevel::Info,
        &format!(
            "Processing complete: {} succeeded, {} failed",
            success_count, error_count
        ),
    );
    sink.send(ExecutionMessage::Complete {
        success_count,
        error_count,
    });
}
