//! Recording session lifecycle: countdown, segments, finalize.

pub mod controller;
pub mod countdown;
pub mod events;
pub mod state;

pub use controller::{ControllerHandle, ControllerOptions, SessionController};
pub use countdown::{CountdownGate, CountdownHandle};
pub use events::{ErrorKind, SessionEvent};
pub use state::{CommandAck, SegmentRecord, Session, SessionCommand, SessionSnapshot, SessionState};
