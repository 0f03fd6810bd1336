use std::path::{Path, PathBuf};
use tracing::debug;

use super::CaptureError;

pub const CAPTURE_CLI_NAME: &str = "swiftcap";
pub const CAPTURE_CLI_ENV: &str = "SWIFTCAP_CLI_PATH";

/// Locate the capture CLI.
///
/// Checked in order: the configured path, `$SWIFTCAP_CLI_PATH`, a binary next
/// to the running executable, then `PATH`.
pub fn resolve_capture_cli(configured: Option<&str>) -> Result<PathBuf, CaptureError> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(CaptureError::BinaryNotFound(format!(
            "configured capture.cli_path {:?} does not exist",
            path
        )));
    }

    if let Ok(env_path) = std::env::var(CAPTURE_CLI_ENV) {
        let path = PathBuf::from(env_path.trim());
        if path.is_file() {
            debug!("Using capture CLI from {}: {:?}", CAPTURE_CLI_ENV, path);
            return Ok(path);
        }
    }

    if let Some(path) = sibling_of_current_exe() {
        return Ok(path);
    }

    which::which(CAPTURE_CLI_NAME).map_err(|_| {
        CaptureError::BinaryNotFound(format!(
            "{} is not installed. Install it or set {}",
            CAPTURE_CLI_NAME, CAPTURE_CLI_ENV
        ))
    })
}

fn sibling_of_current_exe() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = sibling_binary(exe.parent()?);
    candidate.is_file().then_some(candidate)
}

fn sibling_binary(dir: &Path) -> PathBuf {
    if cfg!(windows) {
        dir.join(format!("{}.exe", CAPTURE_CLI_NAME))
    } else {
        dir.join(CAPTURE_CLI_NAME)
    }
}
