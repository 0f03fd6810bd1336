use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Upper bound for `capture.stop_timeout_seconds`.
const MAX_STOP_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recording: RecordingConfig,
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    pub api: ApiConfig,
}

/// Options forwarded to the capture CLI for every segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Pre-roll before the first segment starts, in seconds
    pub countdown_seconds: u32,
    pub fps: u32,
    /// Video bitrate in kbit/s
    pub bitrate: u32,
    pub audio: bool,
    pub cursor: bool,
    /// Container format (mp4 | mkv), also used as the output extension
    pub container: String,
    /// Region override in `WxH` or `WxH+X+Y` form. Empty means "whole display at spawn time".
    pub region: String,
    /// 0 = unlimited
    pub max_duration_seconds: u32,
    pub threads: u32,
    pub qp: u32,
    pub nice: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Explicit path of the `swiftcap` capture CLI. Empty = auto-detect.
    pub cli_path: String,
    /// How long a capture process gets to finalize its file after SIGINT
    /// before it is killed. Clamped to 1..=300.
    pub stop_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Empty = $SWIFTCAP_VIDEOS_DIR, then the XDG videos directory
    pub videos_dir: String,
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            countdown_seconds: 3,
            fps: 30,
            bitrate: 4000,
            audio: true,
            cursor: true,
            container: "mp4".to_string(),
            region: String::new(),
            max_duration_seconds: 0,
            threads: 0,
            qp: 0,
            nice: 0,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            cli_path: String::new(),
            stop_timeout_seconds: 5,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            videos_dir: String::new(),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 3838 }
    }
}

impl RecordingConfig {
    /// Output extension derived from the container, falling back to mp4.
    pub fn extension(&self) -> &str {
        match self.container.trim() {
            "mkv" => "mkv",
            _ => "mp4",
        }
    }

    pub fn region_override(&self) -> Option<&str> {
        let region = self.region.trim();
        (!region.is_empty()).then_some(region)
    }
}

impl CaptureConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds.clamp(1, MAX_STOP_TIMEOUT_SECONDS))
    }

    pub fn cli_path_override(&self) -> Option<&str> {
        let path = self.cli_path.trim();
        (!path.is_empty()).then_some(path)
    }
}

impl OutputConfig {
    pub fn videos_dir_override(&self) -> Option<&str> {
        let dir = self.videos_dir.trim();
        (!dir.is_empty()).then_some(dir)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config = Self::parse(&content)?;

        info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
