use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Command;

const APP_DIR: &str = "swiftcap";

/// Overrides the directory recordings are written to.
pub const VIDEOS_DIR_ENV: &str = "SWIFTCAP_VIDEOS_DIR";

pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .context("Unable to determine config directory")
}

pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve where segments and merged recordings live.
///
/// Order: explicit `configured` value, `$SWIFTCAP_VIDEOS_DIR`, `xdg-user-dir VIDEOS`,
/// the platform videos dir, `~/Videos`, then `./videos`.
pub fn videos_dir(configured: Option<&str>) -> PathBuf {
    if let Some(dir) = configured.map(str::trim).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var(VIDEOS_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }
    if let Some(dir) = lookup_xdg_videos() {
        return dir;
    }
    if let Some(dir) = dirs::video_dir() {
        return dir;
    }
    if let Some(home) = dirs::home_dir() {
        return home.join("Videos");
    }
    PathBuf::from("./videos")
}

/// Resolve the videos directory and make sure it exists.
pub fn ensure_videos_dir(configured: Option<&str>) -> Result<PathBuf> {
    let dir = videos_dir(configured);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create videos directory {:?}", dir))?;
    Ok(dir)
}

fn lookup_xdg_videos() -> Option<PathBuf> {
    let output = Command::new("xdg-user-dir").arg("VIDEOS").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}
