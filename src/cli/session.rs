//! CLI handlers for session commands.
//!
//! All commands talk to the running service over its HTTP API.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::cli::args::CliCommand;

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

pub async fn handle_session_command(command: CliCommand, port: u16) -> Result<()> {
    let base = base_url(port);
    match command {
        CliCommand::Start => {
            let json = post(&base, "start").await?;
            println!("Countdown started (session {})", str_field(&json, "session_id"));
        }
        CliCommand::Cancel => {
            post(&base, "cancel").await?;
            println!("Countdown cancelled");
        }
        CliCommand::Pause => {
            post(&base, "pause").await?;
            println!("Recording paused");
        }
        CliCommand::Resume => {
            post(&base, "resume").await?;
            println!("Recording resumed");
        }
        CliCommand::Stop => {
            post(&base, "stop").await?;
            println!("Recording stopped, saving in background. Check `status` for the file.");
        }
        CliCommand::Status => show_status(&base).await?,
        CliCommand::Serve | CliCommand::Version => {
            bail!("{:?} is not a session command", command)
        }
    }
    Ok(())
}

async fn post(base: &str, path: &str) -> Result<Value> {
    let response = reqwest::Client::new()
        .post(format!("{}/{}", base, path))
        .send()
        .await
        .context("Failed to connect to swiftcap-recorder service. Is it running?")?;

    let status = response.status();
    let json: Value = response.json().await?;

    if !status.is_success() {
        bail!(
            "{}",
            json.get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error")
        );
    }

    Ok(json)
}

async fn show_status(base: &str) -> Result<()> {
    let json: Value = reqwest::Client::new()
        .get(format!("{}/status", base))
        .send()
        .await
        .context("Failed to connect to swiftcap-recorder service. Is it running?")?
        .json()
        .await?;

    print!("{}", render_status(&json));
    Ok(())
}

fn render_status(json: &Value) -> String {
    let mut out = format!("State:    {}\n", str_field(json, "state"));

    match json.get("state").and_then(|v| v.as_str()) {
        Some("counting_down") => {
            if let Some(n) = json.get("countdown_remaining").and_then(|v| v.as_u64()) {
                out.push_str(&format!("Starts in {}s\n", n));
            }
        }
        Some("recording") | Some("paused") | Some("finalizing") => {
            out.push_str(&format!("Elapsed:  {}\n", str_field(json, "elapsed")));
            out.push_str(&format!(
                "Segments: {}\n",
                json.get("segment_count").and_then(|v| v.as_u64()).unwrap_or(0)
            ));
        }
        _ => {}
    }

    if let Some(path) = json.get("last_output").and_then(|v| v.as_str()) {
        out.push_str(&format!("Last:     {}\n", path));
    }
    if let Some(err) = json.get("last_error").and_then(|v| v.as_str()) {
        out.push_str(&format!("Error:    {}\n", err));
    }
    out
}

fn str_field<'a>(json: &'a Value, key: &str) -> &'a str {
    json.get(key).and_then(|v| v.as_str()).unwrap_or("unknown")
}
