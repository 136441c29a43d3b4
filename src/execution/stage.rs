//! Stage Runner
//!
//! Drives one stage for one subject through its lifecycle:
//!
//! ```text
//! Idle -> PrerequisitesChecked -> [Cleaning] -> SnapshotTaken -> Running
//!      -> Succeeded | RolledBack | Failed
//! ```
//!
//! Prerequisite failures end the stage before anything on disk changes. An
//! operation failure rolls `processed_tmp` back to its pre-stage snapshot.

use super::executor::{OperationExecutor, OperationOutcome};
use super::invalidation::{InvalidationReport, OutputInvalidator};
use super::prerequisites::PrerequisiteValidator;
use super::snapshot::{DirectorySnapshot, RollbackReport};
use crate::config::{PipelineConfig, Stage, ToolConfig};
use crate::protocol::{LogLevel, MessageSink};
use crate::subject::Subject;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a stage run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Idle,
    PrerequisitesChecked,
    Cleaning,
    SnapshotTaken,
    Running,
    Succeeded,
    RolledBack,
    Failed,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded | StageState::RolledBack | StageState::Failed
        )
    }
}

/// Everything that happened while running a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: String,
    pub state: StageState,
    /// Unresolved inputs when prerequisites failed
    pub missing: Vec<String>,
    pub invalidation: Option<InvalidationReport>,
    pub completed_operations: usize,
    /// Reasons for skipped operations
    pub skipped: Vec<String>,
    pub error: Option<String>,
    pub rollback: Option<RollbackReport>,
}

impl StageReport {
    fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            state: StageState::Idle,
            missing: Vec::new(),
            invalidation: None,
            completed_operations: 0,
            skipped: Vec::new(),
            error: None,
            rollback: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == StageState::Succeeded
    }

    fn transition(&mut self, next: StageState) {
        if self.state.is_terminal() {
            tracing::warn!(stage = %self.stage, from = ?self.state, to = ?next, "Ignoring transition out of a final state");
            return;
        }
        tracing::debug!(stage = %self.stage, from = ?self.state, to = ?next, "Stage transition");
        self.state = next;
    }
}

/// Runs stages, reporting progress through a message sink
pub struct StageRunner<'a> {
    tools: &'a ToolConfig,
    sink: &'a dyn MessageSink,
}

impl<'a> StageRunner<'a> {
    pub fn new(tools: &'a ToolConfig, sink: &'a dyn MessageSink) -> Self {
        Self { tools, sink }
    }

    /// Run a stage and report only whether it succeeded
    pub fn run(
        &self,
        stage: &Stage,
        subject: &Subject,
        config: &PipelineConfig,
        total_stages: usize,
    ) -> bool {
        self.run_with_report(stage, subject, config, total_stages)
            .succeeded()
    }

    /// Run a stage.
    ///
    /// `total_stages` is the number of stages in the current invocation;
    /// auto-clean only happens when a single stage is re-run on its own.
    pub fn run_with_report(
        &self,
        stage: &Stage,
        subject: &Subject,
        config: &PipelineConfig,
        total_stages: usize,
    ) -> StageReport {
        let mut report = StageReport::new(&stage.name);
        self.sink.log(
            LogLevel::Info,
            &format!("Preparing to run stage: {}", stage.name),
        );

        match PrerequisiteValidator::validate(subject, &stage.name, config) {
            Ok(prerequisites) if prerequisites.is_satisfied() => {
                report.transition(StageState::PrerequisitesChecked);
            }
            Ok(prerequisites) => {
                self.sink.log(
                    LogLevel::Error,
                    &format!(
                        "Prerequisites not met for stage '{}'. Missing required files: {}",
                        stage.name,
                        prerequisites.missing.join(", ")
                    ),
                );
                report.missing = prerequisites.missing;
                report.transition(StageState::Failed);
                return report;
            }
            Err(e) => {
                self.sink.log(LogLevel::Error, &e.to_string());
                report.error = Some(e.to_string());
                report.transition(StageState::Failed);
                return report;
            }
        }

        let single_stage_mode = total_stages == 1;
        if stage.auto_clean && single_stage_mode {
            report.transition(StageState::Cleaning);
            match OutputInvalidator::invalidate(subject, &stage.name, config, single_stage_mode) {
                Ok(invalidation) => {
                    self.sink.log(
                        LogLevel::Info,
                        &format!(
                            "Cleaned {} stale output(s) of '{}' and later stages",
                            invalidation.removed.len(),
                            stage.name
                        ),
                    );
                    for (path, reason) in &invalidation.failures {
                        self.sink.log(
                            LogLevel::Warning,
                            &format!("Could not remove {}: {}", path.display(), reason),
                        );
                    }
                    report.invalidation = Some(invalidation);
                }
                Err(e) => self.sink.log(LogLevel::Warning, &format!("Auto-clean skipped: {}", e)),
            }
        }

        let snapshot = match DirectorySnapshot::capture(&subject.processed_tmp()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.sink.log(
                    LogLevel::Error,
                    &format!("Cannot snapshot processed_tmp for stage '{}': {}", stage.name, e),
                );
                report.error = Some(e.to_string());
                report.transition(StageState::Failed);
                return report;
            }
        };
        report.transition(StageState::SnapshotTaken);

        report.transition(StageState::Running);
        let executor = OperationExecutor::new(subject, self.tools);
        let total = stage.operations.len();

        for (index, operation) in stage.operations.iter().enumerate() {
            self.sink.log(
                LogLevel::Info,
                &format!("Operation {}/{}: {}", index + 1, total, operation.kind),
            );

            match executor.execute(operation) {
                Ok(OperationOutcome::Completed) => report.completed_operations += 1,
                Ok(OperationOutcome::Skipped(reason)) => {
                    self.sink.log(LogLevel::Warning, &reason);
                    report.skipped.push(reason);
                }
                Err(e) => {
                    let message = format!("Stage '{}' failed: {}", stage.name, e);
                    tracing::warn!(stage = %stage.name, subject = %subject.name(), error = %e, "Operation failed");
                    self.sink.log(LogLevel::Error, &message);
                    report.error = Some(message);
                    self.roll_back(&snapshot, &mut report);
                    return report;
                }
            }
        }

        self.sink.log(
            LogLevel::Success,
            &format!("Stage '{}' completed successfully", stage.name),
        );
        report.transition(StageState::Succeeded);
        report
    }

    fn roll_back(&self, snapshot: &DirectorySnapshot, report: &mut StageReport) {
        match snapshot.rollback() {
            Ok(rollback) => {
                if rollback.is_clean() {
                    self.sink.log(
                        LogLevel::Info,
                        &format!("Rolled back {} new file(s) from processed_tmp", rollback.removed.len()),
                    );
                } else {
                    self.sink.log(
                        LogLevel::Warning,
                        &format!(
                            "Rollback incomplete: {} entr(ies) could not be removed",
                            rollback.failures.len()
                        ),
                    );
                }
                report.rollback = Some(rollback);
                report.transition(StageState::RolledBack);
            }
            Err(e) => {
                self.sink.log(LogLevel::Warning, &format!("Rollback failed: {}", e));
                report.transition(StageState::Failed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Operation, OperationKind};
    use crate::testing::{fake_fsl, fake_tool, RecordingSink, ALWAYS_FAILS, WRITES_LAST_ARG};
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn crop_stage(auto_clean: bool) -> Stage {
        Stage {
            name: "Crop".to_string(),
            operations: vec![Operation::new(
                OperationKind::Crop,
                Some("processed_tmp"),
                &["${name}_CT_Bone", "${name}_CT_Bone_C"],
            )],
            auto_clean,
        }
    }

    fn register_stage() -> Stage {
        Stage {
            name: "Register".to_string(),
            operations: vec![
                Operation::new(
                    OperationKind::Crop,
                    Some("processed_tmp"),
                    &["${name}_CT_Bone_C", "${name}_tmp_crop"],
                ),
                Operation::new(
                    OperationKind::Coregister,
                    Some("processed_tmp"),
                    &["${name}_tmp_crop", "${name}_CT_Bone_C", "${name}_reg"],
                ),
            ],
            auto_clean: false,
        }
    }

    fn pipeline(auto_clean: bool) -> PipelineConfig {
        let mut stage_outputs = HashMap::new();
        stage_outputs.insert("Crop".to_string(), vec!["${name}_CT_Bone_C*".to_string()]);
        stage_outputs.insert("Register".to_string(), vec!["${name}_reg*".to_string()]);
        PipelineConfig {
            stages: vec![crop_stage(auto_clean), register_stage()],
            stage_outputs,
        }
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_final_state_is_sticky() {
        let mut report = StageReport::new("Crop");
        report.transition(StageState::Running);
        report.transition(StageState::RolledBack);
        report.transition(StageState::Succeeded);
        assert_eq!(report.state, StageState::RolledBack);
        assert!(!report.succeeded());
    }

    #[test]
    fn test_crop_stage_succeeds() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "SUBJ").unwrap();
        fs::write(subject.processed_tmp().join("SUBJ_CT_Bone.nii.gz"), b"x").unwrap();
        let tools = fake_fsl(&dir.path().join("fsl"), &[("robustfov", WRITES_LAST_ARG)]);
        let sink = RecordingSink::default();
        let config = pipeline(false);

        let report = StageRunner::new(&tools, &sink).run_with_report(&config.stages[0], &subject, &config, 1);

        assert!(report.succeeded());
        assert!(report.rollback.is_none());
        assert_eq!(report.completed_operations, 1);
        assert!(subject.processed_tmp().join("SUBJ_CT_Bone_C.nii.gz").exists());
        assert_eq!(sink.logs(LogLevel::Success), vec!["Stage 'Crop' completed successfully"]);
    }

    #[test]
    fn test_missing_prerequisite_has_no_side_effects() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "SUBJ").unwrap();
        let marker = dir.path().join("robustfov-ran");
        let body = format!(": > '{}'", marker.display());
        let tools = fake_fsl(&dir.path().join("fsl"), &[("robustfov", body.as_str())]);
        fs::write(subject.processed_tmp().join("SUBJ_unrelated.nii.gz"), b"x").unwrap();
        let before = entries(&subject.processed_tmp());
        let sink = RecordingSink::default();
        let config = pipeline(true);

        let runner = StageRunner::new(&tools, &sink);
        let report = runner.run_with_report(&config.stages[0], &subject, &config, 1);

        assert_eq!(report.state, StageState::Failed);
        assert_eq!(report.missing, vec!["SUBJ_CT_Bone"]);
        assert!(report.invalidation.is_none());
        assert!(!marker.exists(), "no tool may run");
        assert_eq!(entries(&subject.processed_tmp()), before);
        assert!(sink.logs(LogLevel::Error)[0].contains("SUBJ_CT_Bone"));
        assert!(!runner.run(&config.stages[0], &subject, &config, 1));
    }

    #[test]
    fn test_mid_stage_failure_rolls_back() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "SUBJ").unwrap();
        let tmp = subject.processed_tmp();
        fs::write(tmp.join("SUBJ_CT_Bone_C.nii.gz"), b"x").unwrap();
        let tools = fake_fsl(
            &dir.path().join("fsl"),
            &[("robustfov", WRITES_LAST_ARG), ("flirt", ALWAYS_FAILS)],
        );
        let sink = RecordingSink::default();
        let config = pipeline(false);

        let report = StageRunner::new(&tools, &sink).run_with_report(&config.stages[1], &subject, &config, 2);

        assert_eq!(report.state, StageState::RolledBack);
        assert_eq!(report.completed_operations, 1);
        assert!(report.error.as_deref().unwrap().contains("flirt"));
        assert_eq!(report.rollback.as_ref().unwrap().removed.len(), 1);
        assert_eq!(entries(&tmp), vec!["SUBJ_CT_Bone_C.nii.gz"]);
    }

    #[test]
    fn test_single_stage_rerun_invalidates_later_outputs() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "SUBJ").unwrap();
        let tmp = subject.processed_tmp();
        fs::write(tmp.join("SUBJ_CT_Bone.nii.gz"), b"x").unwrap();
        fs::write(tmp.join("SUBJ_CT_Bone_C.nii.gz"), b"old").unwrap();
        fs::write(tmp.join("SUBJ_reg.mat"), b"old").unwrap();

        // Fails if the stale matrix is still present when the crop runs
        let body = format!(
            "[ -e '{}' ] && exit 9\n{}",
            tmp.join("SUBJ_reg.mat").display(),
            WRITES_LAST_ARG
        );
        let tools = fake_fsl(&dir.path().join("fsl"), &[("robustfov", body.as_str())]);
        let sink = RecordingSink::default();
        let config = pipeline(true);

        let report = StageRunner::new(&tools, &sink).run_with_report(&config.stages[0], &subject, &config, 1);

        assert!(report.succeeded(), "error: {:?}", report.error);
        assert_eq!(report.invalidation.as_ref().unwrap().removed.len(), 2);
        assert!(!tmp.join("SUBJ_reg.mat").exists());
        assert_eq!(fs::read(tmp.join("SUBJ_CT_Bone_C.nii.gz")).unwrap(), b"");
    }

    #[test]
    fn test_pipeline_mode_skips_auto_clean() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "SUBJ").unwrap();
        let tmp = subject.processed_tmp();
        fs::write(tmp.join("SUBJ_CT_Bone.nii.gz"), b"x").unwrap();
        fs::write(tmp.join("SUBJ_reg.mat"), b"old").unwrap();
        let tools = fake_fsl(&dir.path().join("fsl"), &[("robustfov", WRITES_LAST_ARG)]);
        let sink = RecordingSink::default();
        let config = pipeline(true);

        let report = StageRunner::new(&tools, &sink).run_with_report(&config.stages[0], &subject, &config, 2);

        assert!(report.succeeded());
        assert!(report.invalidation.is_none());
        assert!(tmp.join("SUBJ_reg.mat").exists());
    }

    #[test]
    fn test_skipped_operation_does_not_fail_stage() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "SUBJ").unwrap();
        fs::write(subject.processed_tmp().join("SUBJ_CT_Bone_C.nii.gz"), b"x").unwrap();
        let bin = dir.path().join("fsl/bin");
        // Consumes its input so the next operation cannot find it
        fake_tool(&bin, "robustfov", r#"rm -f "$3"; for last; do :; done; : > "$last.nii.gz""#);
        let tools = fake_fsl(&dir.path().join("fsl"), &[("flirt", ALWAYS_FAILS)]);

        let stage = Stage {
            name: "Register".to_string(),
            operations: vec![
                Operation::new(
                    OperationKind::Crop,
                    Some("processed_tmp"),
                    &["${name}_CT_Bone_C", "${name}_tmp_crop"],
                ),
                Operation::new(
                    OperationKind::Coregister,
                    Some("processed_tmp"),
                    &["${name}_tmp_crop", "${name}_CT_Bone_C", "${name}_reg"],
                ),
            ],
            auto_clean: false,
        };
        let config = PipelineConfig {
            stages: vec![stage],
            ..PipelineConfig::default()
        };
        let sink = RecordingSink::default();

        let report = StageRunner::new(&tools, &sink).run_with_report(&config.stages[0], &subject, &config, 1);

        assert!(report.succeeded());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(sink.logs(LogLevel::Warning).len(), 1);
    }
}
