//! Display geometry lookup used to size each capture region.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::time::Duration;

/// How long `xdpyinfo` may take before the region is left to the capture CLI.
const XDPYINFO_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Source of the current display size.
///
/// Queried on every segment spawn, so a monitor change between pause and
/// resume is picked up by the next segment.
#[async_trait]
pub trait DisplayGeometry: Send + Sync {
    async fn current_region(&self) -> Result<Region>;
}

/// Reads the root window size from `xdpyinfo`.
pub struct XdpyinfoGeometry {
    program: String,
    timeout: Duration,
}

impl XdpyinfoGeometry {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl Default for XdpyinfoGeometry {
    fn default() -> Self {
        Self::new("xdpyinfo", XDPYINFO_TIMEOUT)
    }
}

#[async_trait]
impl DisplayGeometry for XdpyinfoGeometry {
    async fn current_region(&self) -> Result<Region> {
        let run = tokio::process::Command::new(&self.program)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .with_context(|| format!("{} timed out after {:?}", self.program, self.timeout))?
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            bail!("{} exited with status {}", self.program, output.status);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        parse_dimensions(&text).context("xdpyinfo output has no dimensions line")
    }
}

/// Always reports the same region.
pub struct FixedGeometry(pub Region);

#[async_trait]
impl DisplayGeometry for FixedGeometry {
    async fn current_region(&self) -> Result<Region> {
        Ok(self.0)
    }
}

/// Extract `WxH` from the `dimensions:` line of xdpyinfo output.
pub fn parse_dimensions(text: &str) -> Option<Region> {
    let re = Regex::new(r"dimensions:\s+(\d+)x(\d+)\s+pixels").ok()?;
    let caps = re.captures(text)?;
    let width = caps[1].parse().ok()?;
    let height = caps[2].parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(Region { width, height })
}
