//! Subject Directory Layout
//!
//! A subject is one directory tree holding everything the pipeline knows about
//! a single patient: raw documents, pre- and post-operative images, a scratch
//! area (`processed_tmp`) that stages read from and write to, and the final
//! `pipeline_output`.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DOCUMENTS_DIR: &str = "documents";
pub const PROCESSED_TMP_DIR: &str = "processed_tmp";
pub const PIPELINE_OUTPUT_DIR: &str = "pipeline_output";

/// Image folders created under `images/`
pub const IMAGE_DIRS: [&str; 4] = [
    "images/preop/ct",
    "images/preop/mri",
    "images/postop/ct",
    "images/postop/mri",
];

#[derive(Debug, thiserror::Error)]
pub enum SubjectError {
    #[error("Subject directory not found: {0}")]
    NotFound(PathBuf),
    #[error("Invalid subject directory: {0}")]
    InvalidPath(PathBuf),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SubjectError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SubjectError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Regex matching paths that end with an image suffix.
///
/// A suffix carrying its own extension (any `.`) is matched literally;
/// otherwise `.nii` or `.nii.gz` must follow it.
pub fn suffix_regex(suffix: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(suffix);
    let pattern = if suffix.contains('.') {
        format!("{}$", escaped)
    } else {
        format!(r"{}\.nii(\.gz)?$", escaped)
    };
    Regex::new(&pattern)
}

/// One subject's directory tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    root: PathBuf,
    name: String,
}

impl Subject {
    /// Open an existing subject directory, creating any missing layout folders.
    ///
    /// The root is made absolute: operations change the working directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SubjectError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SubjectError::NotFound(root));
        }
        let root = std::path::absolute(&root).map_err(|e| SubjectError::io(&root, e))?;
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SubjectError::InvalidPath(root.clone()))?;

        let subject = Self { root, name };
        subject.ensure_layout()?;
        Ok(subject)
    }

    /// Create `<parent>/<name>` with the full layout
    pub fn create(parent: &Path, name: &str) -> Result<Self, SubjectError> {
        let root = parent.join(name);
        fs::create_dir_all(&root).map_err(|e| SubjectError::io(&root, e))?;
        tracing::info!(subject = %name, path = %root.display(), "Created subject directory");
        Self::open(root)
    }

    fn ensure_layout(&self) -> Result<(), SubjectError> {
        let dirs = [DOCUMENTS_DIR, PROCESSED_TMP_DIR, PIPELINE_OUTPUT_DIR]
            .into_iter()
            .chain(IMAGE_DIRS);
        for dir in dirs {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).map_err(|e| SubjectError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn documents(&self) -> PathBuf {
        self.root.join(DOCUMENTS_DIR)
    }

    pub fn processed_tmp(&self) -> PathBuf {
        self.root.join(PROCESSED_TMP_DIR)
    }

    pub fn pipeline_output(&self) -> PathBuf {
        self.root.join(PIPELINE_OUTPUT_DIR)
    }

    /// First file under `search_dir` (default: the subject root) whose path
    /// ends with `suffix`, per [`suffix_regex`]. Traversal is recursive and
    /// sorted by file name, so the result is deterministic.
    pub fn find_file(&self, suffix: &str, search_dir: Option<&Path>) -> Option<PathBuf> {
        let regex = match suffix_regex(suffix) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!(suffix = %suffix, error = %e, "Unusable file suffix");
                return None;
            }
        };
        let base = search_dir.unwrap_or(&self.root);
        find_matching(base, |entry| {
            entry.file_type().is_file() && regex.is_match(&entry.path().to_string_lossy())
        })
    }

    /// First directory in the subject tree whose path ends with `suffix`
    pub fn find_folder(&self, suffix: &str) -> Option<PathBuf> {
        let suffix = suffix.trim_end_matches('/');
        find_matching(&self.root, |entry| {
            entry.file_type().is_dir() && entry.path().to_string_lossy().ends_with(suffix)
        })
    }

    /// Remove everything inside `processed_tmp`, returning the number of
    /// top-level entries removed. Entries that cannot be removed are logged.
    pub fn clear_processed_tmp(&self) -> Result<usize, SubjectError> {
        let dir = self.processed_tmp();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SubjectError::io(&dir, e)),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() && !path.is_symlink() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to clear entry")
                }
            }
        }

        tracing::debug!(subject = %self.name, removed, "Cleared processed_tmp");
        Ok(removed)
    }

    /// Registration matrix produced by the MNI normalisation stage, if present
    pub fn mni_transformation_matrix(&self) -> Option<PathBuf> {
        let path = self
            .pipeline_output()
            .join(format!("MNI_{}_ref_brain.mat", self.name));
        path.is_file().then_some(path)
    }
}

fn find_matching(base: &Path, accept: impl Fn(&walkdir::DirEntry) -> bool) -> Option<PathBuf> {
    WalkDir::new(base)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .find(|entry| accept(entry))
        .map(|entry| entry.into_path())
}
