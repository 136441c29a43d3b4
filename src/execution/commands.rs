//! Tool Command Templates
//!
//! Maps each operation kind to the exact external program and argument list
//! it runs. Only the fixed templates below can be launched; operation files
//! only ever fill argument slots.

use crate::config::{OperationKind, ToolConfig, Toolbox};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Full-rotation search window shared by the flirt templates
const SEARCH_WINDOW: [&str; 9] = [
    "-searchrx", "-180", "180", "-searchry", "-180", "180", "-searchrz", "-180", "180",
];

/// One external program launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Short tool name used in logs and failures
    pub tool: &'static str,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Discard the tool's stdout instead of relaying it to the log
    pub quiet: bool,
}

impl ToolInvocation {
    fn new(tool: &'static str, program: PathBuf) -> Self {
        Self {
            tool,
            program,
            args: Vec::new(),
            quiet: false,
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Human-readable command line for logs
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Resolved files handed to a template
#[derive(Debug, Clone)]
pub struct ResolvedFiles<'a> {
    /// Inputs, already located on disk
    pub inputs: &'a [PathBuf],
    /// Output exactly as substituted (possibly relative to the working directory)
    pub output: Option<&'a str>,
}

impl<'a> ResolvedFiles<'a> {
    fn input(&self, index: usize) -> Result<&'a Path, CommandError> {
        self.inputs
            .get(index)
            .map(PathBuf::as_path)
            .ok_or(CommandError::MissingSlot("input"))
    }

    fn output(&self) -> Result<&'a str, CommandError> {
        self.output.ok_or(CommandError::MissingSlot("output"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Template needs an {0} file that was not provided")]
    MissingSlot(&'static str),
    #[error("MNI template is not configured (set FSLDIR)")]
    NoMniTemplate,
}

/// Image path without its `.nii` / `.nii.gz` extension, as the FSL tools expect
pub fn image_stem(path: &Path) -> OsString {
    let text = path.to_string_lossy();
    let stem = text
        .strip_suffix(".nii.gz")
        .or_else(|| text.strip_suffix(".nii"))
        .unwrap_or(&text);
    OsString::from(stem)
}

/// Transformation matrix written next to a registration output
fn matrix_path(output: &str) -> OsString {
    let mut matrix = image_stem(Path::new(output));
    matrix.push(".mat");
    matrix
}

/// Last path component of a possibly relative output, stripped of image extensions
fn output_stem(output: &str) -> String {
    let path = Path::new(output);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| output.to_string());
    image_stem(Path::new(&name)).to_string_lossy().into_owned()
}

/// Build the invocation sequence for one operation
pub fn build_invocations(
    kind: OperationKind,
    files: &ResolvedFiles<'_>,
    tools: &ToolConfig,
) -> Result<Vec<ToolInvocation>, CommandError> {
    let fsl = |program: &'static str| ToolInvocation::new(program, tools.tool_path(Toolbox::Fsl, program));

    let invocations = match kind {
        OperationKind::Crop => vec![fsl("robustfov")
            .args(["-v", "-i"])
            .arg(files.input(0)?)
            .arg("-r")
            .arg(files.output()?)
            .quiet()],

        OperationKind::Move => vec![ToolInvocation::new("mv", tools.tool_path(Toolbox::System, "mv"))
            .arg(files.input(0)?)
            .arg(files.output()?)],

        OperationKind::Copy => vec![ToolInvocation::new("cp", tools.tool_path(Toolbox::System, "cp"))
            .arg("-f")
            .arg(files.input(0)?)
            .arg(files.output()?)],

        OperationKind::Coregister => {
            let output = files.output()?;
            vec![fsl("flirt")
                .arg("-in")
                .arg(image_stem(files.input(0)?))
                .arg("-ref")
                .arg(image_stem(files.input(1)?))
                .arg("-out")
                .arg(output)
                .arg("-omat")
                .arg(matrix_path(output))
                .args(["-bins", "256", "-cost", "mutualinfo"])
                .args(SEARCH_WINDOW)
                .args(["-dof", "6", "-interp", "sinc", "-datatype", "int"])]
        }

        OperationKind::Subtract => vec![fsl("fslmaths")
            .arg(image_stem(files.input(0)?))
            .arg("-sub")
            .arg(image_stem(files.input(1)?))
            .arg(files.output()?)],

        OperationKind::Threshold => vec![fsl("fslmaths")
            .arg(image_stem(files.input(0)?))
            .args(["-thr", "1600"])
            .arg(files.output()?)],

        OperationKind::ApplyTransformation => vec![fsl("flirt")
            .arg("-in")
            .arg(image_stem(files.input(0)?))
            .arg("-applyxfm")
            .arg("-init")
            .arg(files.input(1)?)
            .arg("-out")
            .arg(files.output()?)
            .args(["-paddingsize", "0.0", "-interp", "sinc", "-ref"])
            .arg(image_stem(files.input(2)?))
            .args(["-bins", "256", "-cost", "mutualinfo"])
            .args(SEARCH_WINDOW)
            .args(["-dof", "6", "-interp", "sinc", "-datatype", "int"])],

        OperationKind::ExtractBrain => vec![fsl("bet")
            .arg(image_stem(files.input(0)?))
            .arg(image_stem(Path::new(files.output()?)))
            .args(["-f", "0.45", "-g", "0", "-m"])],

        OperationKind::ExtractBrain2 => vec![fsl("bet")
            .arg(image_stem(files.input(0)?))
            .arg(image_stem(Path::new(files.output()?)))
            .args(["-f", "0.25", "-g", "0"])],

        OperationKind::Mask => vec![fsl("fslmaths")
            .arg(image_stem(files.input(0)?))
            .arg("-mas")
            .arg(image_stem(files.input(1)?))
            .arg(files.output()?)],

        OperationKind::Reconstruct => {
            let output = Path::new(files.output()?);
            let subjects_dir = match output.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            vec![ToolInvocation::new(
                "recon-all",
                tools.tool_path(Toolbox::FreeSurfer, "recon-all"),
            )
            .arg("-sd")
            .arg(subjects_dir)
            .arg("-s")
            .arg(output_stem(files.output()?))
            .arg("-i")
            .arg(files.input(0)?)
            .arg("-all")]
        }

        OperationKind::RegisterCtToMni => {
            let mni = tools.mni_template().ok_or(CommandError::NoMniTemplate)?;
            let output = files.output()?;
            vec![fsl("flirt")
                .arg("-in")
                .arg(files.input(0)?)
                .arg("-ref")
                .arg(mni)
                .arg("-out")
                .arg(output)
                .arg("-omat")
                .arg(matrix_path(output))
                .args(["-cost", "normmi", "-dof", "12"])
                .args(SEARCH_WINDOW)
                .args(["-bins", "256", "-interp", "sinc"])]
        }

        OperationKind::RegisterMriToMni => {
            let mni = tools.mni_template().ok_or(CommandError::NoMniTemplate)?;
            let output = files.output()?;
            let rigid = format!("{}_rigid", output);
            vec![
                fsl("flirt")
                    .arg("-in")
                    .arg(image_stem(files.input(0)?))
                    .arg("-ref")
                    .arg(&mni)
                    .arg("-omat")
                    .arg(format!("{}.mat", rigid))
                    .arg("-out")
                    .arg(&rigid)
                    .args(["-dof", "6", "-cost", "normmi"])
                    .args(SEARCH_WINDOW)
                    .args(["-bins", "256", "-interp", "spline"]),
                fsl("flirt")
                    .arg("-in")
                    .arg(image_stem(files.input(0)?))
                    .arg("-ref")
                    .arg(&mni)
                    .arg("-init")
                    .arg(format!("{}.mat", rigid))
                    .arg("-omat")
                    .arg(format!("{}.mat", output))
                    .arg("-out")
                    .arg(output)
                    .args(["-dof", "12", "-cost", "normmi", "-bins", "256", "-interp", "spline"]),
            ]
        }

        OperationKind::OpenFsleyes => vec![fsl("fsleyes").arg(files.input(0)?)],
    };

    Ok(invocations)
}
