use std::io;
use std::path::Path;
use std::process::Command;

use super::{ConcatTool, ToolOutput};

/// ffmpeg's concat demuxer in stream-copy mode.
#[derive(Debug, Clone)]
pub struct FfmpegConcat {
    ffmpeg_path: String,
}

impl FfmpegConcat {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn args(manifest: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            // absolute paths in the manifest need the unsafe mode
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            manifest.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

impl Default for FfmpegConcat {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl ConcatTool for FfmpegConcat {
    fn command_line(&self, manifest: &Path, output: &Path) -> String {
        let mut parts = vec![self.ffmpeg_path.clone()];
        parts.extend(Self::args(manifest, output));
        parts.join(" ")
    }

    fn run(&self, manifest: &Path, output: &Path) -> io::Result<ToolOutput> {
        let result = Command::new(&self.ffmpeg_path)
            .args(Self::args(manifest, output))
            .output()?;

        Ok(ToolOutput {
            success: result.status.success(),
            exit_code: result.status.code(),
            stdout: String::from_utf8_lossy(&result.stdout).to_string(),
            stderr: String::from_utf8_lossy(&result.stderr).to_string(),
        })
    }
}

/// Check if FFmpeg is available at `ffmpeg_path`.
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> bool {
    Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
