pub mod args;
pub mod session;

pub use args::{Cli, CliCommand};
pub use session::handle_session_command;
