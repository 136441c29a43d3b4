//! Tool Locations
//!
//! Where the external FSL and FreeSurfer binaries live. Built from the
//! environment (`FSLDIR`, `FREESURFER_HOME`, optionally via a `.env` file) or
//! explicitly for tests, then passed by value to everything that launches tools.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const FSL_ENV: &str = "FSLDIR";
const FREESURFER_ENV: &str = "FREESURFER_HOME";
const MNI_TEMPLATE_RELATIVE: &str = "data/standard/MNI152_T1_1mm.nii.gz";

/// External toolbox a program belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Toolbox {
    Fsl,
    FreeSurfer,
    /// Plain system utilities found through `PATH` (mv, cp)
    System,
}

impl Toolbox {
    pub fn env_var(&self) -> Option<&'static str> {
        match self {
            Toolbox::Fsl => Some(FSL_ENV),
            Toolbox::FreeSurfer => Some(FREESURFER_ENV),
            Toolbox::System => None,
        }
    }
}

/// Resolved tool locations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// FSL installation root (`$FSLDIR`)
    pub fsl_dir: Option<PathBuf>,
    /// FreeSurfer installation root (`$FREESURFER_HOME`)
    pub freesurfer_home: Option<PathBuf>,
    /// Override for the MNI reference template
    #[serde(default)]
    pub mni_template: Option<PathBuf>,
}

impl ToolConfig {
    /// Read tool locations from the process environment.
    ///
    /// A `.env` file in the current directory is honoured when present;
    /// variables already set in the environment take precedence.
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }

        let read = |key: &str| {
            std::env::var_os(key)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };

        Self {
            fsl_dir: read(FSL_ENV),
            freesurfer_home: read(FREESURFER_ENV),
            mni_template: None,
        }
    }

    /// Config with an explicit FSL root and nothing else
    pub fn with_fsl_dir(fsl_dir: impl Into<PathBuf>) -> Self {
        Self {
            fsl_dir: Some(fsl_dir.into()),
            ..Self::default()
        }
    }

    pub fn root(&self, toolbox: Toolbox) -> Option<&Path> {
        match toolbox {
            Toolbox::Fsl => self.fsl_dir.as_deref(),
            Toolbox::FreeSurfer => self.freesurfer_home.as_deref(),
            Toolbox::System => None,
        }
    }

    /// Program path for a tool; falls back to a bare name looked up on `PATH`
    /// when its toolbox is not configured.
    pub fn tool_path(&self, toolbox: Toolbox, program: &str) -> PathBuf {
        match self.root(toolbox) {
            Some(root) => root.join("bin").join(program),
            None => PathBuf::from(program),
        }
    }

    /// MNI152 1mm reference template
    pub fn mni_template(&self) -> Option<PathBuf> {
        if let Some(template) = &self.mni_template {
            return Some(template.clone());
        }
        self.fsl_dir
            .as_ref()
            .map(|root| root.join(MNI_TEMPLATE_RELATIVE))
    }

    /// Names of environment variables for toolboxes that are unset or point
    /// at a missing directory.
    pub fn validate_environment(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for toolbox in [Toolbox::Fsl, Toolbox::FreeSurfer] {
            let Some(var) = toolbox.env_var() else {
                continue;
            };
            match self.root(toolbox) {
                None => problems.push(format!("{} is not set", var)),
                Some(root) if !root.is_dir() => {
                    problems.push(format!("{} points to missing directory {}", var, root.display()))
                }
                Some(_) => {}
            }
        }
        problems
    }
}
