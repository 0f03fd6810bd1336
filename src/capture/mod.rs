//! External capture process supervision.
//!
//! Every segment of a session is recorded by its own invocation of the
//! `swiftcap` capture CLI. This module launches those processes, stops them
//! with a graceful interrupt and reports every exit back over a channel so the
//! session controller can consume it on its own loop.

pub mod binary;
pub mod display;
pub mod process;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

pub use binary::resolve_capture_cli;
pub use display::{DisplayGeometry, FixedGeometry, Region, XdpyinfoGeometry};
pub use process::{CaptureOptions, SegmentProcessManager};

/// Identity of a running capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub pid: u32,
    pub segment_index: u32,
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment {} (pid {})", self.segment_index, self.pid)
    }
}

/// Notification that a capture process has terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub handle: ProcessHandle,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Whether the process ignored the interrupt and had to be killed
    pub forced: bool,
}

/// What the controller asks for when it needs a new segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub index: u32,
    pub file_path: PathBuf,
    pub audio: bool,
}

pub type ExitSender = mpsc::UnboundedSender<ProcessExit>;
pub type ExitReceiver = mpsc::UnboundedReceiver<ProcessExit>;

/// Channel pair carrying exit notifications from a backend to the controller.
pub fn exit_channel() -> (ExitSender, ExitReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture CLI not found: {0}")]
    BinaryNotFound(String),

    #[error("failed to launch capture process for segment {index}: {source}")]
    Launch {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("capture process for segment {0} was started without a valid pid")]
    InvalidHandle(u32),

    #[error("no running capture process for {0}")]
    NotRunning(ProcessHandle),
}

/// Launches and stops capture processes.
///
/// Implementations deliver a [`ProcessExit`] for every process they start,
/// whether it was asked to stop or died on its own.
#[async_trait]
pub trait CaptureBackend: Send {
    async fn spawn_segment(
        &mut self,
        request: &SegmentRequest,
    ) -> Result<ProcessHandle, CaptureError>;

    /// Ask a process to finish its file and exit. Must not block.
    fn request_stop(&mut self, handle: &ProcessHandle) -> Result<(), CaptureError>;
}
