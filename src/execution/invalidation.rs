//! Output Invalidation
//!
//! Re-running a stage makes everything it and every later stage produced
//! stale. The invalidator deletes those outputs from `processed_tmp`, using
//! the glob patterns declared (or derived) per stage. Nothing outside
//! `processed_tmp` is ever touched.

use super::resolver::substitute;
use crate::config::PipelineConfig;
use crate::subject::Subject;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum InvalidationError {
    #[error("Stage '{0}' is not defined in the configuration")]
    UnknownStage(String),
}

/// Stages and patterns an invalidation would act on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationPlan {
    /// Target stage followed by every later stage, in declaration order
    pub stages: Vec<String>,
    /// Substituted patterns relative to `processed_tmp`, in stage order
    pub patterns: Vec<String>,
}

/// What an invalidation actually did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub removed: Vec<PathBuf>,
    /// Paths that matched but could not be removed, with the reason
    pub failures: Vec<(PathBuf, String)>,
    /// Patterns refused because they could escape `processed_tmp`
    pub rejected_patterns: Vec<String>,
}

/// Deletes stale stage outputs
pub struct OutputInvalidator;

impl OutputInvalidator {
    /// Compute what invalidating `stage_name` covers, without touching disk
    pub fn plan(
        subject: &Subject,
        stage_name: &str,
        config: &PipelineConfig,
    ) -> Result<InvalidationPlan, InvalidationError> {
        let index = config
            .stage_index(stage_name)
            .ok_or_else(|| InvalidationError::UnknownStage(stage_name.to_string()))?;

        let stages: Vec<String> = config.stages[index..]
            .iter()
            .map(|stage| stage.name.clone())
            .collect();

        let mut patterns = Vec::new();
        for stage in &stages {
            for pattern in config.output_patterns(stage) {
                let substituted = substitute(&pattern, subject.name(), subject.root());
                if !patterns.contains(&substituted) {
                    patterns.push(substituted);
                }
            }
        }

        Ok(InvalidationPlan { stages, patterns })
    }

    /// Delete the outputs of `stage_name` and all later stages.
    ///
    /// Does nothing unless the stage has `auto_clean` set. `single_stage_mode`
    /// is recorded for diagnostics only; deciding when to invalidate belongs
    /// to the caller. Per-path failures are collected, never fatal.
    pub fn invalidate(
        subject: &Subject,
        stage_name: &str,
        config: &PipelineConfig,
        single_stage_mode: bool,
    ) -> Result<InvalidationReport, InvalidationError> {
        let stage = config
            .stage(stage_name)
            .ok_or_else(|| InvalidationError::UnknownStage(stage_name.to_string()))?;

        let mut report = InvalidationReport::default();
        if !stage.auto_clean {
            tracing::debug!(stage = %stage_name, "auto_clean disabled, nothing invalidated");
            return Ok(report);
        }

        let plan = Self::plan(subject, stage_name, config)?;
        let processed_tmp = subject.processed_tmp();
        tracing::info!(
            stage = %stage_name,
            subject = %subject.name(),
            single_stage_mode,
            affected_stages = ?plan.stages,
            "Invalidating stage outputs"
        );

        for pattern in &plan.patterns {
            if !is_contained(pattern) {
                tracing::warn!(pattern = %pattern, "Refusing pattern outside processed_tmp");
                report.rejected_patterns.push(pattern.clone());
                continue;
            }

            let full = format!(
                "{}/{}",
                glob::Pattern::escape(&processed_tmp.to_string_lossy()),
                pattern
            );
            let paths = match glob::glob(&full) {
                Ok(paths) => paths,
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Invalid output pattern");
                    report.rejected_patterns.push(pattern.clone());
                    continue;
                }
            };

            for entry in paths {
                match entry {
                    Ok(path) if path.starts_with(&processed_tmp) => {
                        match remove_entry(&path) {
                            Ok(true) => {
                                tracing::debug!(path = %path.display(), "Removed stale output");
                                report.removed.push(path);
                            }
                            Ok(false) => {}
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale output");
                                report.failures.push((path, e.to_string()));
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let path = e.path().to_path_buf();
                        report.failures.push((path, e.error().to_string()));
                    }
                }
            }
        }

        tracing::info!(
            stage = %stage_name,
            removed = report.removed.len(),
            failed = report.failures.len(),
            "Invalidation finished"
        );
        Ok(report)
    }
}

/// Relative and free of parent components
fn is_contained(pattern: &str) -> bool {
    let path = Path::new(pattern);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Remove a file, symlink or directory tree. `Ok(false)` when already gone.
fn remove_entry(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
