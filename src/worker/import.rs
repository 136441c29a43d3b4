//! Import job: bring raw images into subject folders, cropping and
//! optionally coregistering each one to a reference image.

use crate::config::{OperationKind, ToolConfig};
use crate::execution::commands::{build_invocations, ResolvedFiles};
use crate::execution::executor::{run_tool, ExecutionError};
use crate::protocol::{ExecutionMessage, LogLevel, MessageSink};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_needs_crop() -> bool {
    true
}

/// One image to import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub subject_name: String,
    pub source_image_path: PathBuf,
    pub output_path: PathBuf,
    /// Label shown in logs, e.g. `CT_preop`
    pub image_identifier: String,
    #[serde(default = "default_needs_crop")]
    pub needs_crop: bool,
    #[serde(default)]
    pub registration_target_path: Option<PathBuf>,
    #[serde(default)]
    pub registration_target_identifier: Option<String>,
    /// Where the crop goes when a registration follows it
    #[serde(default)]
    pub temp_crop_path: Option<PathBuf>,
}

impl ImportJob {
    fn operation_count(&self) -> usize {
        usize::from(self.needs_crop) + usize::from(self.registration_target_path.is_some())
    }
}

/// Work order for an import run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatch {
    pub jobs: Vec<ImportJob>,
    #[serde(default)]
    pub tools: ToolConfig,
}

/// Path of an image a tool wrote, accepting the `.nii.gz` FSL appends
fn locate_image(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let text = path.to_string_lossy();
    [".nii.gz", ".nii"]
        .iter()
        .map(|ext| PathBuf::from(format!("{}{}", text, ext)))
        .find(|candidate| candidate.is_file())
}

/// Deletes the temporary crop on every exit path
struct TempCrop {
    path: Option<PathBuf>,
}

impl Drop for TempCrop {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        if let Some(found) = locate_image(&path) {
            match fs::remove_file(&found) {
                Ok(()) => tracing::debug!(path = %found.display(), "Removed temporary crop"),
                Err(e) => tracing::warn!(path = %found.display(), error = %e, "Failed to remove temporary crop"),
            }
        }
    }
}

fn run_operation(
    kind: OperationKind,
    inputs: &[PathBuf],
    output: &Path,
    tools: &ToolConfig,
) -> Result<(), ExecutionError> {
    let workdir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&workdir).map_err(|source| ExecutionError::WorkdirChange {
        path: workdir.clone(),
        source,
    })?;

    let output = output.to_string_lossy();
    let files = ResolvedFiles {
        inputs,
        output: Some(output.as_ref()),
    };
    for invocation in build_invocations(kind, &files, tools)? {
        run_tool(&invocation, &workdir)?;
    }
    Ok(())
}

struct Importer<'a> {
    tools: &'a ToolConfig,
    sink: &'a dyn MessageSink,
    completed_operations: usize,
    total_operations: usize,
}

impl Importer<'_> {
    fn progress(&mut self) {
        self.completed_operations += 1;
        self.sink.send(ExecutionMessage::Progress {
            index: self.completed_operations,
            total: self.total_operations,
        });
    }

    /// Import one image, returning the success message or the failure reason
    fn import(&mut self, job: &ImportJob) -> Result<String, String> {
        if !job.source_image_path.exists() {
            return Err(format!(
                "Source image not found: {}",
                job.source_image_path.display()
            ));
        }

        let registering = job.registration_target_path.is_some();
        let crop_output = match (&job.temp_crop_path, job.needs_crop) {
            (Some(temp), true) if registering => Some(temp.clone()),
            (_, true) => Some(job.output_path.clone()),
            (_, false) => None,
        };
        let _temp = TempCrop {
            path: crop_output.clone().filter(|p| *p != job.output_path),
        };

        let mut working_image = job.source_image_path.clone();
        if let Some(crop_output) = &crop_output {
            self.sink.log(LogLevel::Info, &format!("  Cropping {}", job.image_identifier));
            run_operation(
                OperationKind::Crop,
                &[job.source_image_path.clone()],
                crop_output,
                self.tools,
            )
            .map_err(|e| format!("Crop error for {}: {}", job.image_identifier, e))?;

            working_image = locate_image(crop_output).ok_or_else(|| {
                format!("Crop failed - output not created: {}", crop_output.display())
            })?;
            self.progress();
            self.sink.log(LogLevel::Success, &format!("  Cropped {}", job.image_identifier));
        }

        if let Some(target) = &job.registration_target_path {
            if !target.exists() {
                return Err(format!("Registration target not found: {}", target.display()));
            }
            let target_label = job
                .registration_target_identifier
                .as_deref()
                .unwrap_or("reference");
            self.sink.log(
                LogLevel::Info,
                &format!("  Coregistering {} to {}", job.image_identifier, target_label),
            );
            run_operation(
                OperationKind::Coregister,
                &[working_image, target.clone()],
                &job.output_path,
                self.tools,
            )
            .map_err(|e| format!("Registration error for {}: {}", job.image_identifier, e))?;

            locate_image(&job.output_path).ok_or_else(|| {
                format!(
                    "Registration failed - output not created: {}",
                    job.output_path.display()
                )
            })?;
            self.progress();
            self.sink.log(
                LogLevel::Success,
                &format!("  Coregistered {}", job.image_identifier),
            );
            return Ok(format!(
                "Successfully imported and coregistered {}",
                job.image_identifier
            ));
        }

        if crop_output.is_some() {
            return Ok(format!("Successfully imported and cropped {}", job.image_identifier));
        }

        if job.source_image_path != job.output_path {
            if let Some(parent) = job.output_path.parent() {
                fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            fs::copy(&job.source_image_path, &job.output_path)
                .map_err(|e| format!("Copy error for {}: {}", job.image_identifier, e))?;
        }
        Ok(format!("Successfully imported {}", job.image_identifier))
    }
}

/// Run every import job in order, reporting per-job completion
pub fn run_import(batch: &ImportBatch, sink: &dyn MessageSink) {
    let total_jobs = batch.jobs.len();
    let mut importer = Importer {
        tools: &batch.tools,
        sink,
        completed_operations: 0,
        total_operations: batch.jobs.iter().map(ImportJob::operation_count).sum(),
    };
    let mut success_count = 0;
    let mut error_count = 0;

    sink.log(LogLevel::Info, &format!("Starting import of {} image(s)", total_jobs));

    for (position, job) in batch.jobs.iter().enumerate() {
        let index = position + 1;
        if sink.is_cancelled() {
            break;
        }

        let plan = match &job.registration_target_identifier {
            Some(target) if job.registration_target_path.is_some() => {
                format!("will coregister to {}", target)
            }
            _ if job.needs_crop => "crop only".to_string(),
            _ => "copy".to_string(),
        };
        sink.log(
            LogLevel::Info,
            &format!("[{}/{}] {} ({})", index, total_jobs, job.image_identifier, plan),
        );
        tracing::debug!(subject = %job.subject_name, image = %job.image_identifier, "Importing image");

        let (success, message) = match importer.import(job) {
            Ok(message) => {
                success_count += 1;
                sink.log(LogLevel::Success, &message);
                (true, message)
            }
            Err(message) => {
                error_count += 1;
                sink.log(LogLevel::Error, &message);
                (false, message)
            }
        };
        sink.send(ExecutionMessage::JobComplete {
            index,
            success,
            message,
        });
    }

    sink.log(
        LogLevel::Info,
        &format!(
            "Import complete: {} succeeded, {} failed",
            success_count, error_count
        ),
    );
    sink.send(ExecutionMessage::Complete {
        success_count,
        error_count,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_fsl, writes_flag, RecordingSink, ALWAYS_FAILS};
    use tempfile::tempdir;

    fn job(dir: &Path, identifier: &str) -> ImportJob {
        let source = dir.join(format!("raw_{}.nii.gz", identifier));
        fs::write(&source, b"x").unwrap();
        ImportJob {
            subject_name: "S".to_string(),
            source_image_path: source,
            output_path: dir.join(format!("S/images/preop/ct/S_{}.nii.gz", identifier)),
            image_identifier: identifier.to_string(),
            needs_crop: true,
            registration_target_path: None,
            registration_target_identifier: None,
            temp_crop_path: None,
        }
    }

    fn completions(sink: &RecordingSink) -> Vec<(usize, bool)> {
        sink.messages()
            .into_iter()
            .filter_map(|m| match m {
                ExecutionMessage::JobComplete { index, success, .. } => Some((index, success)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_crop_and_register_cleans_temp_crop() {
        let dir = tempdir().unwrap();
        let crop = writes_flag("-r");
        let flirt = writes_flag("-out");
        let tools = fake_fsl(
            &dir.path().join("fsl"),
            &[("robustfov", crop.as_str()), ("flirt", flirt.as_str())],
        );
        let reference = dir.path().join("ref.nii.gz");
        fs::write(&reference, b"x").unwrap();

        let mut registered = job(dir.path(), "CT");
        registered.registration_target_path = Some(reference);
        registered.registration_target_identifier = Some("MRI".to_string());
        registered.temp_crop_path = Some(dir.path().join("tmp/S_CT_crop"));
        let batch = ImportBatch { jobs: vec![registered.clone()], tools };
        let sink = RecordingSink::default();

        run_import(&batch, &sink);

        assert!(registered.output_path.exists());
        assert!(!dir.path().join("tmp/S_CT_crop.nii.gz").exists());
        assert_eq!(completions(&sink), vec![(1, true)]);
        let messages = sink.messages();
        assert!(messages.contains(&ExecutionMessage::Progress { index: 2, total: 2 }));
        assert_eq!(
            messages.last(),
            Some(&ExecutionMessage::Complete { success_count: 1, error_count: 0 })
        );
    }

    #[test]
    fn test_failures_are_per_job() {
        let dir = tempdir().unwrap();
        let crop = writes_flag("-r");
        let tools = fake_fsl(
            &dir.path().join("fsl"),
            &[("robustfov", crop.as_str()), ("flirt", ALWAYS_FAILS)],
        );

        let mut missing_source = job(dir.path(), "A");
        missing_source.source_image_path = dir.path().join("nope.nii.gz");
        let crop_only = job(dir.path(), "B");
        let mut failing_registration = job(dir.path(), "C");
        failing_registration.registration_target_path = Some(crop_only.source_image_path.clone());
        failing_registration.temp_crop_path = Some(dir.path().join("tmp/S_C_crop"));

        let batch = ImportBatch {
            jobs: vec![missing_source, crop_only.clone(), failing_registration],
            tools,
        };
        let sink = RecordingSink::default();

        run_import(&batch, &sink);

        assert_eq!(completions(&sink), vec![(1, false), (2, true), (3, false)]);
        assert!(crop_only.output_path.exists());
        assert!(!dir.path().join("tmp/S_C_crop.nii.gz").exists());
        assert_eq!(
            sink.messages().last(),
            Some(&ExecutionMessage::Complete { success_count: 1, error_count: 2 })
        );
    }

    #[test]
    fn test_no_crop_no_registration_copies_source() {
        let dir = tempdir().unwrap();
        let mut plain = job(dir.path(), "MRI");
        plain.needs_crop = false;
        let batch = ImportBatch {
            jobs: vec![plain.clone()],
            tools: ToolConfig::default(),
        };
        let sink = RecordingSink::default();

        run_import(&batch, &sink);

        assert_eq!(fs::read(&plain.output_path).unwrap(), b"x");
        assert_eq!(completions(&sink), vec![(1, true)]);
    }

    #[test]
    fn test_job_defaults() {
        let json = r#"{
            "subject_name": "S",
            "source_image_path": "/raw/ct.nii.gz",
            "output_path": "/out/S_CT.nii.gz",
            "image_identifier": "CT"
        }"#;
        let job: ImportJob = serde_json::from_str(json).unwrap();
        assert!(job.needs_crop);
        assert_eq!(job.operation_count(), 1);
    }
}
