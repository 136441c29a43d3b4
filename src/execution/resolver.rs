//! File Resolution
//!
//! Turns operation file templates into concrete paths inside a subject tree.
//! Inputs are located by suffix search in a fixed priority order; outputs are
//! only substituted.

use crate::config::{NAME_PLACEHOLDER, SUBJECT_DIR_PLACEHOLDER};
use crate::subject::Subject;
use std::path::{Path, PathBuf};

/// Replace `${name}` and `${subj_dir}` in a template
pub fn substitute(template: &str, subject_name: &str, subject_root: &Path) -> String {
    template
        .replace(NAME_PLACEHOLDER, subject_name)
        .replace(SUBJECT_DIR_PLACEHOLDER, &subject_root.to_string_lossy())
}

/// Outcome of looking up an input template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(PathBuf),
    /// Nothing matched; carries the substituted search string
    NotFound { pattern: String },
}

impl Resolution {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::Found(path) => Some(path),
            Resolution::NotFound { .. } => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

/// Resolves templates for one subject
#[derive(Debug, Clone, Copy)]
pub struct FileResolver<'a> {
    subject: &'a Subject,
}

impl<'a> FileResolver<'a> {
    pub fn new(subject: &'a Subject) -> Self {
        Self { subject }
    }

    pub fn substitute(&self, template: &str) -> String {
        substitute(template, self.subject.name(), self.subject.root())
    }

    /// Output templates are substituted literally and never searched
    pub fn output(&self, template: &str) -> String {
        self.substitute(template)
    }

    /// Directory an operation's `workdir` suffix refers to
    pub fn workdir(&self, suffix: &str) -> Option<PathBuf> {
        self.subject.find_folder(suffix)
    }

    /// Locate an input template.
    ///
    /// Search order: the `search_dir` folder (when given and present), then
    /// `processed_tmp`, then the whole subject tree. An absolute substituted
    /// path that already names a file is returned as is.
    pub fn resolve(&self, template: &str, search_dir: Option<&str>) -> Resolution {
        let pattern = self.substitute(template);

        let literal = Path::new(&pattern);
        if literal.is_absolute() && literal.is_file() {
            return Resolution::Found(literal.to_path_buf());
        }

        let scoped = search_dir.and_then(|suffix| self.workdir(suffix));
        let processed_tmp = self.subject.processed_tmp();
        let candidates = scoped
            .iter()
            .map(PathBuf::as_path)
            .chain(std::iter::once(processed_tmp.as_path()).filter(|p| p.is_dir()))
            .chain(std::iter::once(self.subject.root()));

        for dir in candidates {
            if let Some(found) = self.subject.find_file(&pattern, Some(dir)) {
                tracing::trace!(pattern = %pattern, found = %found.display(), "Resolved input");
                return Resolution::Found(found);
            }
        }

        Resolution::NotFound { pattern }
    }
}
