use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "swiftcap-recorder")]
#[command(about = "Segmented screen recording with pause and resume", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// API port of the running service (default: from config)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliCommand {
    /// Run the recorder service (default)
    Serve,
    /// Start the countdown, then record
    Start,
    /// Cancel a running countdown
    Cancel,
    /// Pause the recording
    Pause,
    /// Resume a paused recording
    Resume,
    /// Stop and save the recording
    Stop,
    /// Show the session status
    Status,
    /// Print version information
    Version,
}
