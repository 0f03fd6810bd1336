//! Session data model and the read-only snapshot handed to observers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::events::ErrorKind;
use crate::capture::ProcessHandle;

/// Lifecycle state of a recording session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    CountingDown,
    Recording,
    Paused,
    Finalizing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CountingDown => "counting_down",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-issued commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCommand {
    Start,
    CancelCountdown,
    Pause,
    Resume,
    Stop,
}

impl SessionCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::CancelCountdown => "cancel_countdown",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }

    /// Whether the command is legal in `state`.
    pub fn allowed_in(&self, state: SessionState) -> bool {
        matches!(
            (self, state),
            (Self::Start, SessionState::Idle)
                | (Self::CancelCountdown, SessionState::CountingDown)
                | (Self::Pause, SessionState::Recording)
                | (Self::Resume, SessionState::Paused)
                | (Self::Stop, SessionState::Recording | SessionState::Paused)
        )
    }
}

impl fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous answer to a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandAck {
    Accepted,
    Rejected { state: SessionState },
    /// Legal, but could not be carried out; the state is unchanged
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub index: u32,
    pub file_path: PathBuf,
    /// Present only while this segment's capture process is running
    pub process: Option<ProcessHandle>,
}

/// The unit of work from `Start` until it is finalized or cancelled.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    pub segments: Vec<SegmentRecord>,
    pub elapsed_seconds: u64,
    pub ticks_since_resume: u64,
    pub manifest_path: Option<PathBuf>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            state: SessionState::Idle,
            segments: Vec::new(),
            elapsed_seconds: 0,
            ticks_since_resume: 0,
            manifest_path: None,
        }
    }
}

impl Session {
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::CountingDown,
            ..Self::default()
        }
    }

    pub fn next_segment_index(&self) -> u32 {
        self.segments.last().map(|s| s.index + 1).unwrap_or(1)
    }

    /// The segment whose capture process is running, if any.
    pub fn live_segment(&self) -> Option<&SegmentRecord> {
        self.segments.iter().find(|s| s.process.is_some())
    }

    pub fn live_handle(&self) -> Option<ProcessHandle> {
        self.live_segment().and_then(|s| s.process)
    }

    /// Drop every process handle, returning the one that was live.
    pub fn clear_handles(&mut self) -> Option<ProcessHandle> {
        let mut live = None;
        for segment in &mut self.segments {
            if let Some(handle) = segment.process.take() {
                live = Some(handle);
            }
        }
        live
    }

    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.file_path.clone()).collect()
    }
}

/// Read-only view of the controller, served to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub elapsed_seconds: u64,
    pub segment_count: usize,
    pub recording: bool,
    pub paused: bool,
    pub ticks_since_resume: u64,
    pub countdown_remaining: Option<u32>,
    pub last_output: Option<PathBuf>,
    pub last_error: Option<String>,
}
