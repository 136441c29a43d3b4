//! Pipeline Configuration
//!
//! An already-parsed pipeline description: the ordered list of stages, their
//! operations, and the output patterns each stage leaves behind in a subject's
//! `processed_tmp` directory.
//!
//! Configurations are stored as JSON:
//!
//! ```json
//! {
//!   "stages": [
//!     {
//!       "name": "Crop",
//!       "auto_clean": true,
//!       "operations": [
//!         { "type": "crop", "workdir": "processed_tmp",
//!           "files": ["${name}_CT_Bone", "${name}_CT_Bone_C"] }
//!       ]
//!     }
//!   ],
//!   "stage_outputs": { "Crop": ["${name}_CT_Bone_C*"] }
//! }
//! ```

pub mod tools;

pub use tools::{ToolConfig, Toolbox};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Placeholder replaced by the subject identifier
pub const NAME_PLACEHOLDER: &str = "${name}";

/// Placeholder replaced by the subject root directory
pub const SUBJECT_DIR_PLACEHOLDER: &str = "${subj_dir}";

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),
    #[error("Outputs declared for unknown stage: {0}")]
    UnknownStageOutputs(String),
    #[error("Operation {index} of stage '{stage}' declares no files")]
    EmptyOperation { stage: String, index: usize },
}

/// Kind of external tool invocation an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Crop,
    Move,
    Copy,
    Coregister,
    Subtract,
    Threshold,
    ApplyTransformation,
    ExtractBrain,
    #[serde(rename = "extract_brain2")]
    ExtractBrain2,
    Mask,
    Reconstruct,
    RegisterCtToMni,
    RegisterMriToMni,
    OpenFsleyes,
}

impl OperationKind {
    /// Configuration name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Crop => "crop",
            OperationKind::Move => "move",
            OperationKind::Copy => "copy",
            OperationKind::Coregister => "coregister",
            OperationKind::Subtract => "subtract",
            OperationKind::Threshold => "threshold",
            OperationKind::ApplyTransformation => "apply_transformation",
            OperationKind::ExtractBrain => "extract_brain",
            OperationKind::ExtractBrain2 => "extract_brain2",
            OperationKind::Mask => "mask",
            OperationKind::Reconstruct => "reconstruct",
            OperationKind::RegisterCtToMni => "register_ct_to_mni",
            OperationKind::RegisterMriToMni => "register_mri_to_mni",
            OperationKind::OpenFsleyes => "open_fsleyes",
        }
    }

    /// Number of file entries (inputs plus output) the kind consumes
    pub fn file_count(&self) -> usize {
        match self {
            OperationKind::OpenFsleyes => 1,
            OperationKind::Crop
            | OperationKind::Move
            | OperationKind::Copy
            | OperationKind::Threshold
            | OperationKind::ExtractBrain
            | OperationKind::ExtractBrain2
            | OperationKind::Reconstruct
            | OperationKind::RegisterCtToMni
            | OperationKind::RegisterMriToMni => 2,
            OperationKind::Coregister | OperationKind::Subtract | OperationKind::Mask => 3,
            OperationKind::ApplyTransformation => 4,
        }
    }

    /// Viewer operations never fail a stage on a non-zero exit
    pub fn is_viewer(&self) -> bool {
        matches!(self, OperationKind::OpenFsleyes)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single external tool invocation with its file templates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Directory suffix to run in and to search first for inputs
    #[serde(default)]
    pub workdir: Option<String>,
    /// File templates; the last entry of a multi-file operation is the output
    pub files: Vec<String>,
}

impl Operation {
    pub fn new(kind: OperationKind, workdir: Option<&str>, files: &[&str]) -> Self {
        Self {
            kind,
            workdir: workdir.map(str::to_string),
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Input templates (searched for on disk)
    pub fn inputs(&self) -> &[String] {
        match self.files.len() {
            0 | 1 => &self.files,
            n => &self.files[..n - 1],
        }
    }

    /// Output template (substituted literally), present for multi-file operations
    pub fn output(&self) -> Option<&str> {
        if self.files.len() > 1 {
            self.files.last().map(String::as_str)
        } else {
            None
        }
    }
}

/// A named, ordered group of operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub operations: Vec<Operation>,
    /// Invalidate this stage's and later stages' outputs before a re-run
    #[serde(default)]
    pub auto_clean: bool,
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages in declaration order
    pub stages: Vec<Stage>,
    /// Stage name -> glob patterns (relative to `processed_tmp`) of produced files
    #[serde(default)]
    pub stage_outputs: HashMap<String, Vec<String>>,
}

impl PipelineConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            stages = config.stages.len(),
            "Loaded pipeline configuration"
        );
        Ok(config)
    }

    /// Parse and validate a configuration from JSON text
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants the execution engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
            for (index, operation) in stage.operations.iter().enumerate() {
                if operation.files.is_empty() {
                    return Err(ConfigError::EmptyOperation {
                        stage: stage.name.clone(),
                        index,
                    });
                }
            }
        }

        for name in self.stage_outputs.keys() {
            if !seen.contains(name.as_str()) {
                return Err(ConfigError::UnknownStageOutputs(name.clone()));
            }
        }

        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Position of a stage in declaration order
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Output patterns for a stage.
    ///
    /// Declared patterns win. A stage without a declaration falls back to
    /// `<output>*` for each operation output that lives in the working area
    /// (outputs rooted at `${subj_dir}` point elsewhere and are skipped).
    pub fn output_patterns(&self, stage_name: &str) -> Vec<String> {
        if let Some(patterns) = self.stage_outputs.get(stage_name) {
            return patterns.clone();
        }

        let Some(stage) = self.stage(stage_name) else {
            return Vec::new();
        };

        let mut patterns: Vec<String> = Vec::new();
        for operation in &stage.operations {
            if let Some(output) = operation.output() {
                if output.starts_with(SUBJECT_DIR_PLACEHOLDER) {
                    continue;
                }
                let pattern = format!("{}*", output);
                if !patterns.contains(&pattern) {
                    patterns.push(pattern);
                }
            }
        }
        patterns
    }
}
