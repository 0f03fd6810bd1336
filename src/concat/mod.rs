//! Segment concatenation.
//!
//! Stitches the segment files of a session into one output with a stream
//! copy, then removes the intermediates. Anything that goes wrong leaves every
//! file where it was so the user can recover the footage by hand.

pub mod ffmpeg;

use chrono::{DateTime, Local};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::ErrorKind;

pub use ffmpeg::{check_ffmpeg_available, FfmpegConcat};

/// What a concatenation tool reported after running.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// External tool that joins the files listed in a manifest into `output`.
pub trait ConcatTool: Send + Sync {
    /// Human-readable command line, used in diagnostics.
    fn command_line(&self, manifest: &Path, output: &Path) -> String;

    /// Run to completion, capturing stdout and stderr.
    fn run(&self, manifest: &Path, output: &Path) -> io::Result<ToolOutput>;
}

#[derive(Debug, Error)]
pub enum ConcatError {
    #[error("no segments were recorded")]
    NoSegments,

    #[error("none of the {} segment files exist", missing.len())]
    AllSegmentsMissing { missing: Vec<PathBuf> },

    #[error("failed to write concat manifest {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to run `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("concatenation failed\n{0}")]
    ToolFailed(String),

    #[error("concatenation reported success but produced no output\n{0}")]
    OutputMissing(String),
}

impl ConcatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllSegmentsMissing { .. } => ErrorKind::MissingSegmentFile,
            Self::Manifest { .. } => ErrorKind::FilesystemFailure,
            Self::NoSegments | Self::Launch { .. } | Self::ToolFailed(_) | Self::OutputMissing(_) => {
                ErrorKind::ConcatenationFailure
            }
        }
    }
}

/// Result of a successful finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub output: PathBuf,
    /// Segments that were expected but not on disk
    pub missing: Vec<PathBuf>,
    /// Intermediates that could not be removed
    pub cleanup_warnings: Vec<String>,
}

#[derive(Clone)]
pub struct ConcatenationPipeline {
    tool: Arc<dyn ConcatTool>,
}

impl ConcatenationPipeline {
    pub fn new(tool: Arc<dyn ConcatTool>) -> Self {
        Self { tool }
    }

    /// Merge `segments` into `output`. Blocking.
    pub fn finalize(
        &self,
        segments: &[PathBuf],
        manifest: &Path,
        output: &Path,
    ) -> Result<FinalizeReport, ConcatError> {
        if segments.is_empty() {
            return Err(ConcatError::NoSegments);
        }

        let (present, missing): (Vec<&PathBuf>, Vec<&PathBuf>) =
            segments.iter().partition(|path| path.is_file());
        let missing: Vec<PathBuf> = missing.into_iter().cloned().collect();

        for path in &missing {
            warn!("Segment file {:?} is missing, skipping it", path);
        }
        if present.is_empty() {
            return Err(ConcatError::AllSegmentsMissing { missing });
        }

        write_manifest(manifest, &present).map_err(|source| ConcatError::Manifest {
            path: manifest.to_path_buf(),
            source,
        })?;

        let command = self.tool.command_line(manifest, output);
        info!(
            "Concatenating {} segment(s) into {:?}",
            present.len(),
            output
        );
        debug!("Running: {}", command);

        let result = self
            .tool
            .run(manifest, output)
            .map_err(|source| ConcatError::Launch {
                command: command.clone(),
                source,
            })?;

        if !result.success {
            return Err(ConcatError::ToolFailed(diagnostic(&command, &result)));
        }
        if !output.is_file() {
            return Err(ConcatError::OutputMissing(diagnostic(&command, &result)));
        }

        let mut cleanup_warnings = Vec::new();
        for path in present.iter().copied().map(PathBuf::as_path).chain([manifest]) {
            if let Err(e) = std::fs::remove_file(path) {
                cleanup_warnings.push(format!("failed to remove {:?}: {}", path, e));
            }
        }
        for warning in &cleanup_warnings {
            warn!("{}", warning);
        }

        Ok(FinalizeReport {
            output: output.to_path_buf(),
            missing,
            cleanup_warnings,
        })
    }
}

/// Render one `file '<path>'` line per segment, in order.
pub fn manifest_contents(segments: &[&PathBuf]) -> String {
    segments
        .iter()
        .map(|path| {
            let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
            format!("file '{}'\n", escape_single_quotes(&absolute.to_string_lossy()))
        })
        .collect()
}

fn write_manifest(manifest: &Path, segments: &[&PathBuf]) -> io::Result<()> {
    if let Some(parent) = manifest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(manifest, manifest_contents(segments))
}

fn escape_single_quotes(path: &str) -> String {
    path.replace('\'', r"'\''")
}

fn diagnostic(command: &str, output: &ToolOutput) -> String {
    let exit = output
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    format!(
        "command: {}\nexit: {}\nstdout: {}\nstderr: {}",
        command,
        exit,
        output.stdout.trim(),
        output.stderr.trim()
    )
}

/// `recording_<YYYYMMDD>_<HHMMSS>.<ext>` in `dir`, suffixed `_<n>` if taken.
pub fn output_path(dir: &Path, now: DateTime<Local>, extension: &str) -> PathBuf {
    let stem = format!("recording_{}", now.format("%Y%m%d_%H%M%S"));
    let mut candidate = dir.join(format!("{}.{}", stem, extension));
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.{}", stem, counter, extension));
        counter += 1;
    }
    candidate
}
