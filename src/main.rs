use anyhow::Result;
use clap::Parser;
use swiftcap_recorder::{
    app,
    cli::{handle_session_command, Cli, CliCommand},
    config::Config,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        None | Some(CliCommand::Serve) => app::run_service().await,
        Some(CliCommand::Version) => {
            println!("swiftcap-recorder {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(command) => {
            let port = match cli.port {
                Some(port) => port,
                None => Config::load()?.api.port,
            };
            handle_session_command(command, port).await
        }
    }
}
