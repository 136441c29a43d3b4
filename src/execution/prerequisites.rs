//! Prerequisite Validation
//!
//! Read-only check that every input a stage needs can be resolved before any
//! of its operations run.

use super::resolver::FileResolver;
use crate::config::PipelineConfig;
use crate::subject::Subject;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PrerequisiteError {
    #[error("Stage '{0}' is not defined in the configuration")]
    UnknownStage(String),
}

/// Result of validating one stage for one subject
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteReport {
    pub stage: String,
    /// Number of input templates that had to exist on disk
    pub checked: usize,
    /// Substituted templates that did not resolve, in declaration order
    pub missing: Vec<String>,
}

impl PrerequisiteReport {
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Checks stage inputs without touching the filesystem
pub struct PrerequisiteValidator;

impl PrerequisiteValidator {
    /// Validate every input template of `stage_name`.
    ///
    /// Inputs written by an earlier operation of the same stage are not
    /// required up front: an input counts as produced when its file name is
    /// a preceding operation's output, bare or with an image or matrix
    /// extension.
    pub fn validate(
        subject: &Subject,
        stage_name: &str,
        config: &PipelineConfig,
    ) -> Result<PrerequisiteReport, PrerequisiteError> {
        let stage = config
            .stage(stage_name)
            .ok_or_else(|| PrerequisiteError::UnknownStage(stage_name.to_string()))?;

        let resolver = FileResolver::new(subject);
        let mut produced: Vec<String> = Vec::new();
        let mut missing: Vec<String> = Vec::new();
        let mut checked = 0;

        for operation in &stage.operations {
            for template in operation.inputs() {
                let substituted = resolver.substitute(template);
                if is_produced(&substituted, &produced) {
                    continue;
                }
                checked += 1;
                if !resolver.resolve(template, operation.workdir.as_deref()).is_found()
                    && !missing.contains(&substituted)
                {
                    missing.push(substituted);
                }
            }

            if let Some(output) = operation.output() {
                if let Some(name) = file_name(&resolver.output(output)) {
                    produced.push(name);
                }
            }
        }

        if missing.is_empty() {
            tracing::debug!(stage = %stage_name, subject = %subject.name(), checked, "Prerequisites satisfied");
        } else {
            tracing::info!(
                stage = %stage_name,
                subject = %subject.name(),
                missing = ?missing,
                "Prerequisites not met"
            );
        }

        Ok(PrerequisiteReport {
            stage: stage_name.to_string(),
            checked,
            missing,
        })
    }
}

fn file_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Extensions a tool may add to the output name it was given
const OUTPUT_EXTENSIONS: [&str; 3] = [".nii", ".nii.gz", ".mat"];

fn is_produced(input: &str, produced: &[String]) -> bool {
    let Some(name) = file_name(input) else {
        return false;
    };
    produced.iter().any(|output| match name.strip_prefix(output.as_str()) {
        Some("") => true,
        Some(rest) => OUTPUT_EXTENSIONS.contains(&rest),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Operation, OperationKind, Stage};
    use std::fs;
    use tempfile::tempdir;
    use walkdir::WalkDir;

    fn config(operations: Vec<Operation>) -> PipelineConfig {
        PipelineConfig {
            stages: vec![Stage {
                name: "Register".to_string(),
                operations,
                auto_clean: false,
            }],
            ..PipelineConfig::default()
        }
    }

    fn listing(root: &Path) -> Vec<std::path::PathBuf> {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .map(|e| e.unwrap().into_path())
            .collect()
    }

    #[test]
    fn test_all_inputs_present() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "S").unwrap();
        fs::write(subject.processed_tmp().join("S_CT.nii.gz"), b"x").unwrap();
        fs::write(subject.processed_tmp().join("S_MRI.nii.gz"), b"x").unwrap();

        let config = config(vec![Operation::new(
            OperationKind::Coregister,
            Some("processed_tmp"),
            &["${name}_CT", "${name}_MRI", "${name}_reg"],
        )]);

        let report = PrerequisiteValidator::validate(&subject, "Register", &config).unwrap();
        assert!(report.is_satisfied());
        assert_eq!(report.checked, 2);
    }

    #[test]
    fn test_missing_inputs_are_substituted() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "S").unwrap();
        fs::write(subject.processed_tmp().join("S_CT.nii.gz"), b"x").unwrap();

        let config = config(vec![Operation::new(
            OperationKind::Coregister,
            None,
            &["${name}_CT", "${name}_MRI", "${name}_reg"],
        )]);

        let report = PrerequisiteValidator::validate(&subject, "Register", &config).unwrap();
        assert!(!report.is_satisfied());
        assert_eq!(report.missing, vec!["S_MRI"]);
    }

    #[test]
    fn test_inputs_produced_within_stage_are_not_required() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "S").unwrap();
        fs::write(subject.processed_tmp().join("S_CT.nii.gz"), b"x").unwrap();
        fs::write(subject.processed_tmp().join("S_MRI.nii.gz"), b"x").unwrap();

        let config = config(vec![
            Operation::new(
                OperationKind::Coregister,
                None,
                &["${name}_CT", "${name}_MRI", "${name}_reg"],
            ),
            Operation::new(
                OperationKind::ApplyTransformation,
                None,
                &["${name}_CT", "${name}_reg.mat", "${name}_MRI", "${name}_final"],
            ),
        ]);

        let report = PrerequisiteValidator::validate(&subject, "Register", &config).unwrap();
        assert!(report.is_satisfied(), "missing: {:?}", report.missing);
        assert_eq!(report.checked, 4);
    }

    #[test]
    fn test_output_name_prefix_does_not_cover_other_inputs() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "S").unwrap();
        fs::write(subject.processed_tmp().join("S_raw.nii.gz"), b"x").unwrap();

        // S_CT_Bone shares a prefix with the S_CT output but nothing writes it
        let config = config(vec![
            Operation::new(OperationKind::Crop, None, &["${name}_raw", "${name}_CT"]),
            Operation::new(OperationKind::Crop, None, &["${name}_CT_Bone", "${name}_CT_Bone_C"]),
            Operation::new(OperationKind::Crop, None, &["${name}_CT.nii.gz", "${name}_CT_C"]),
        ]);

        let report = PrerequisiteValidator::validate(&subject, "Register", &config).unwrap();
        assert_eq!(report.missing, vec!["S_CT_Bone"]);
        assert_eq!(report.checked, 2);
    }

    #[test]
    fn test_unknown_stage() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "S").unwrap();
        let err = PrerequisiteValidator::validate(&subject, "Nope", &config(vec![])).unwrap_err();
        assert!(matches!(err, PrerequisiteError::UnknownStage(name) if name == "Nope"));
    }

    #[test]
    fn test_validation_never_mutates_filesystem() {
        let dir = tempdir().unwrap();
        let subject = Subject::create(dir.path(), "S").unwrap();
        fs::write(subject.processed_tmp().join("S_CT.nii.gz"), b"x").unwrap();
        let before = listing(dir.path());

        let config = config(vec![Operation::new(
            OperationKind::Coregister,
            Some("processed_tmp"),
            &["${name}_CT", "${name}_MRI", "${name}_reg"],
        )]);
        let _ = PrerequisiteValidator::validate(&subject, "Register", &config).unwrap();

        assert_eq!(listing(dir.path()), before);
        assert_eq!(fs::read(subject.processed_tmp().join("S_CT.nii.gz")).unwrap(), b"x");
    }
}
