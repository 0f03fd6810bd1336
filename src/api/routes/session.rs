//! Session control endpoints.
//!
//! - `POST /start`, `/cancel`, `/pause`, `/resume`, `/stop`
//! - `GET /status` (optionally `?style=waybar`)

use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::session::{CommandAck, ControllerHandle, SessionCommand, SessionSnapshot, SessionState};

pub fn router(controller: ControllerHandle) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/cancel", post(cancel))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .with_state(controller)
}

async fn start(State(controller): State<ControllerHandle>) -> ApiResult<Json<Value>> {
    run_command(&controller, SessionCommand::Start).await
}

async fn cancel(State(controller): State<ControllerHandle>) -> ApiResult<Json<Value>> {
    run_command(&controller, SessionCommand::CancelCountdown).await
}

async fn pause(State(controller): State<ControllerHandle>) -> ApiResult<Json<Value>> {
    run_command(&controller, SessionCommand::Pause).await
}

async fn resume(State(controller): State<ControllerHandle>) -> ApiResult<Json<Value>> {
    run_command(&controller, SessionCommand::Resume).await
}

async fn stop(State(controller): State<ControllerHandle>) -> ApiResult<Json<Value>> {
    run_command(&controller, SessionCommand::Stop).await
}

/// Dispatch `command` and answer with the state the controller settled in.
async fn run_command(
    controller: &ControllerHandle,
    command: SessionCommand,
) -> ApiResult<Json<Value>> {
    info!("{} command received via API", command);

    match controller.dispatch(command).await? {
        CommandAck::Accepted => {
            // queued behind the command, so this reflects its effect
            let snapshot = controller.snapshot().await?;
            Ok(Json(json!({
                "success": true,
                "command": command.as_str(),
                "state": snapshot.state.as_str(),
                "session_id": snapshot.session_id,
            })))
        }
        CommandAck::Rejected { state } => Err(ApiError::conflict(
            format!("Cannot {} while {}", command.as_str(), state.as_str()),
            state,
        )),
        CommandAck::Failed { kind, message } => {
            Err(ApiError::internal(format!("{}: {}", kind, message)))
        }
    }
}

async fn status(
    Query(params): Query<HashMap<String, String>>,
    State(controller): State<ControllerHandle>,
) -> ApiResult<Json<Value>> {
    let snapshot = controller.snapshot().await?;

    if params.get("style").map(String::as_str) == Some("waybar") {
        return Ok(Json(waybar_response(&snapshot)));
    }

    Ok(Json(json!({
        "state": snapshot.state.as_str(),
        "recording": snapshot.recording,
        "paused": snapshot.paused,
        "session_id": snapshot.session_id,
        "elapsed_seconds": snapshot.elapsed_seconds,
        "elapsed": format_elapsed(snapshot.elapsed_seconds),
        "segment_count": snapshot.segment_count,
        "ticks_since_resume": snapshot.ticks_since_resume,
        "countdown_remaining": snapshot.countdown_remaining,
        "last_output": snapshot.last_output,
        "last_error": snapshot.last_error,
    })))
}

/// `{text, class, tooltip}` for a Waybar custom module.
fn waybar_response(snapshot: &SessionSnapshot) -> Value {
    let elapsed = format_elapsed(snapshot.elapsed_seconds);
    let (text, class, tooltip) = match snapshot.state {
        SessionState::Idle => (
            String::new(),
            "swiftcap-idle",
            match &snapshot.last_error {
                Some(err) => format!("Last recording failed: {}", err),
                None => "Not recording".to_string(),
            },
        ),
        SessionState::CountingDown => (
            format!("{}", snapshot.countdown_remaining.unwrap_or(0)),
            "swiftcap-countdown",
            "Recording starts soon".to_string(),
        ),
        SessionState::Recording => (
            format!("● {}", elapsed),
            "swiftcap-recording",
            format!("Recording, segment {}", snapshot.segment_count),
        ),
        SessionState::Paused => (
            format!("⏸ {}", elapsed),
            "swiftcap-paused",
            format!("Paused after {} segment(s)", snapshot.segment_count),
        ),
        SessionState::Finalizing => (
            "…".to_string(),
            "swiftcap-finalizing",
            "Saving recording".to_string(),
        ),
    };

    json!({
        "text": text,
        "class": class,
        "tooltip": tooltip
    })
}

/// `MM:SS`, or `H:MM:SS` past the hour.
pub fn format_elapsed(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
