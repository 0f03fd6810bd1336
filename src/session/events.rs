use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::state::{SessionCommand, SessionState};

/// Failure categories reported through [`SessionEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProcessSpawnFailure,
    InvalidStateTransition,
    UnexpectedProcessExit,
    MissingSegmentFile,
    ConcatenationFailure,
    FilesystemFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessSpawnFailure => "process_spawn_failure",
            Self::InvalidStateTransition => "invalid_state_transition",
            Self::UnexpectedProcessExit => "unexpected_process_exit",
            Self::MissingSegmentFile => "missing_segment_file",
            Self::ConcatenationFailure => "concatenation_failure",
            Self::FilesystemFailure => "filesystem_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the controller tells the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged { state: SessionState },
    ElapsedTick { seconds: u64 },
    CountdownTick { remaining: u32 },
    RecordingSaved { path: PathBuf },
    Error { kind: ErrorKind, message: String },
    PreconditionFailed {
        command: SessionCommand,
        state: SessionState,
    },
}

impl SessionEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }
}
