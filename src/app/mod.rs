use crate::api::ApiServer;
use crate::capture::{exit_channel, CaptureOptions, SegmentProcessManager, XdpyinfoGeometry};
use crate::concat::{check_ffmpeg_available, ConcatenationPipeline, FfmpegConcat};
use crate::config::Config;
use crate::global;
use crate::session::{
    CommandAck, ControllerHandle, ControllerOptions, SessionCommand, SessionController,
    SessionEvent, SessionState,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn run_service() -> Result<()> {
    info!("Starting swiftcap-recorder service");

    let config = Config::load()?;

    let videos_dir = global::ensure_videos_dir(config.output.videos_dir_override())?;
    info!("Recordings are saved to {:?}", videos_dir);

    if !check_ffmpeg_available(&config.output.ffmpeg_path) {
        warn!(
            "{} was not found; recordings cannot be merged until it is installed",
            config.output.ffmpeg_path
        );
    }

    let (exit_tx, exit_rx) = exit_channel();
    let capture = SegmentProcessManager::new(
        CaptureOptions {
            cli_path: config.capture.cli_path_override().map(str::to_string),
            recording: config.recording.clone(),
            stop_timeout: config.capture.stop_timeout(),
        },
        Box::new(XdpyinfoGeometry::default()),
        exit_tx,
    );
    let pipeline =
        ConcatenationPipeline::new(Arc::new(FfmpegConcat::new(config.output.ffmpeg_path.clone())));

    let (controller, handle) = SessionController::new(
        ControllerOptions::from_config(&config),
        Box::new(capture),
        pipeline,
        exit_rx,
    );

    spawn_event_logger(&handle);

    let api_server = ApiServer::new(handle.clone(), &config);
    tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            error!("API server failed: {:#}", e);
        }
    });

    let port = config.api.port;
    info!("swiftcap-recorder is ready!");
    info!("Bind keys to the API, for example in Hyprland:");
    info!(
        "bindd = SUPER SHIFT, R, Record screen, exec, curl -X POST http://127.0.0.1:{}/start",
        port
    );
    info!("Or use the CLI: swiftcap-recorder start | pause | resume | stop");

    tokio::spawn(controller.run());

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    wind_down(&handle).await;

    Ok(())
}

/// Save or discard whatever session is in flight before exiting.
async fn wind_down(handle: &ControllerHandle) {
    let mut events = handle.subscribe();
    let snapshot = match handle.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Could not query session state: {:#}", e);
            return;
        }
    };

    let command = match snapshot.state {
        SessionState::CountingDown => SessionCommand::CancelCountdown,
        SessionState::Recording | SessionState::Paused => SessionCommand::Stop,
        SessionState::Finalizing => {
            info!("Waiting for the recording to be saved");
            wait_for_idle(&mut events).await;
            return;
        }
        SessionState::Idle => return,
    };

    match handle.dispatch(command).await {
        Ok(CommandAck::Accepted) => {
            if command == SessionCommand::Stop {
                info!("Saving the current recording before exit");
                wait_for_idle(&mut events).await;
            }
        }
        Ok(CommandAck::Rejected { state }) => debug!("Nothing to wind down ({})", state),
        Ok(CommandAck::Failed { kind, message }) => {
            warn!("Failed to wind down session: {}: {}", kind, message)
        }
        Err(e) => warn!("Failed to wind down session: {:#}", e),
    }
}

async fn wait_for_idle(events: &mut broadcast::Receiver<SessionEvent>) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged {
                    state: SessionState::Idle,
                }) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait).await.is_err() {
        warn!("Gave up waiting for the session to finish");
    }
}

fn spawn_event_logger(handle: &ControllerHandle) {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Event logger skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { state } => info!("Session is now {}", state),
        SessionEvent::ElapsedTick { seconds } => debug!("Recording for {}s", seconds),
        SessionEvent::CountdownTick { remaining } => info!("Recording in {}...", remaining),
        SessionEvent::RecordingSaved { path } => info!("Saved recording: {}", path.display()),
        SessionEvent::Error { kind, message } => warn!("Session error ({}): {}", kind, message),
        SessionEvent::PreconditionFailed { command, state } => {
            warn!("Ignored {} while {}", command, state)
        }
    }
}
