//! Segment capture processes.
//!
//! One capture CLI invocation per segment. Each process gets a supervisor task
//! that owns the child, forwards stop requests as SIGINT, escalates to a kill
//! when the process ignores the interrupt, and reports the exit.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::binary::resolve_capture_cli;
use super::display::DisplayGeometry;
use super::{CaptureBackend, CaptureError, ExitSender, ProcessExit, ProcessHandle, SegmentRequest};
use crate::config::RecordingConfig;

/// Lines of capture stderr kept for the log when a segment fails.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Explicit capture CLI path; auto-detected when `None`
    pub cli_path: Option<String>,
    pub recording: RecordingConfig,
    pub stop_timeout: Duration,
}

struct RunningCapture {
    stop_tx: oneshot::Sender<()>,
}

pub struct SegmentProcessManager {
    options: CaptureOptions,
    geometry: Box<dyn DisplayGeometry>,
    exits: ExitSender,
    running: HashMap<ProcessHandle, RunningCapture>,
    resolved_cli: Option<PathBuf>,
}

impl SegmentProcessManager {
    pub fn new(
        options: CaptureOptions,
        geometry: Box<dyn DisplayGeometry>,
        exits: ExitSender,
    ) -> Self {
        Self {
            options,
            geometry,
            exits,
            running: HashMap::new(),
            resolved_cli: None,
        }
    }

    fn capture_cli(&mut self) -> Result<PathBuf, CaptureError> {
        if let Some(path) = &self.resolved_cli {
            return Ok(path.clone());
        }
        let path = resolve_capture_cli(self.options.cli_path.as_deref())?;
        info!("Using capture CLI at {:?}", path);
        self.resolved_cli = Some(path.clone());
        Ok(path)
    }

    /// Region for the next segment: the configured override, or the display
    /// size right now.
    async fn region(&self) -> Option<String> {
        if let Some(region) = self.options.recording.region_override() {
            return Some(region.to_string());
        }
        match self.geometry.current_region().await {
            Ok(region) => Some(region.to_string()),
            Err(e) => {
                warn!(
                    "Could not read display geometry ({}), letting the capture CLI pick the region",
                    e
                );
                None
            }
        }
    }
}

#[async_trait]
impl CaptureBackend for SegmentProcessManager {
    async fn spawn_segment(
        &mut self,
        request: &SegmentRequest,
    ) -> Result<ProcessHandle, CaptureError> {
        self.running.retain(|_, capture| !capture.stop_tx.is_closed());

        let cli = self.capture_cli()?;
        let region = self.region().await;
        let args = capture_args(request, &self.options.recording, region.as_deref());

        debug!("Spawning capture: {:?} {}", cli, args.join(" "));

        let mut command = Command::new(&cli);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // keep a terminal Ctrl-C from reaching the capture; stops go through request_stop
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| CaptureError::Launch {
                index: request.index,
                source,
            })?;

        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            return Err(CaptureError::InvalidHandle(request.index));
        };

        let handle = ProcessHandle {
            pid,
            segment_index: request.index,
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            handle,
            stop_rx,
            self.options.stop_timeout,
            self.exits.clone(),
        ));
        self.running.insert(handle, RunningCapture { stop_tx });

        info!(
            "Capture started for {} -> {:?} (region: {})",
            handle,
            request.file_path,
            region.as_deref().unwrap_or("auto")
        );

        Ok(handle)
    }

    fn request_stop(&mut self, handle: &ProcessHandle) -> Result<(), CaptureError> {
        let capture = self
            .running
            .remove(handle)
            .ok_or(CaptureError::NotRunning(*handle))?;

        capture
            .stop_tx
            .send(())
            .map_err(|_| CaptureError::NotRunning(*handle))?;

        debug!("Stop requested for {}", handle);
        Ok(())
    }
}

/// Build the capture CLI argument list for one segment.
pub fn capture_args(
    request: &SegmentRequest,
    recording: &RecordingConfig,
    region: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "record".to_string(),
        "--out".to_string(),
        request.file_path.to_string_lossy().to_string(),
        "--audio".to_string(),
        on_off(request.audio),
        "--cursor".to_string(),
        on_off(recording.cursor),
    ];

    push_positive(&mut args, "--fps", recording.fps);
    push_positive(&mut args, "--bitrate", recording.bitrate);

    args.push("--container".to_string());
    args.push(recording.extension().to_string());

    if let Some(region) = region {
        args.push("--region".to_string());
        args.push(region.to_string());
    }

    push_positive(&mut args, "--max-dur", recording.max_duration_seconds);
    push_positive(&mut args, "--threads", recording.threads);
    push_positive(&mut args, "--qp", recording.qp);

    if recording.nice != 0 {
        args.push("--nice".to_string());
        args.push(recording.nice.to_string());
    }

    args
}

fn on_off(flag: bool) -> String {
    let value = if flag { "on" } else { "off" };
    value.to_string()
}

/// Zero means "leave it to the capture CLI".
fn push_positive(args: &mut Vec<String>, flag: &str, value: u32) {
    if value > 0 {
        args.push(flag.to_string());
        args.push(value.to_string());
    }
}

async fn supervise(
    mut child: Child,
    handle: ProcessHandle,
    mut stop_rx: oneshot::Receiver<()>,
    stop_timeout: Duration,
    exits: ExitSender,
) {
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(stderr_tail(stderr)));

    let mut forced = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut stop_rx => {
            interrupt(&mut child, handle.pid);
            match tokio::time::timeout(stop_timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        "Capture {} did not exit {}s after SIGINT, killing it",
                        handle,
                        stop_timeout.as_secs()
                    );
                    forced = true;
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill capture {}: {}", handle, e);
                    }
                    child.wait().await
                }
            }
        }
    };

    let exit_code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Failed waiting on capture {}: {}", handle, e);
            None
        }
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if matches!(exit_code, Some(code) if code != 0) {
        warn!(
            "Capture {} exited with code {:?}: {}",
            handle, exit_code, stderr
        );
    } else {
        debug!("Capture {} exited with code {:?}", handle, exit_code);
    }

    let _ = exits.send(ProcessExit {
        handle,
        exit_code,
        forced,
    });
}

#[cfg(unix)]
fn interrupt(_child: &mut Child, pid: u32) {
    // SIGINT lets the capture process flush and close its container
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc != 0 {
        warn!(
            "Failed to send SIGINT to pid {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child, pid: u32) {
    warn!("No graceful interrupt on this platform, terminating pid {}", pid);
    let _ = child.start_kill();
}

/// Drain `reader`, keeping only the last [`STDERR_TAIL_LINES`] lines.
async fn stderr_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).split(b'\n');
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_segment().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(String::from_utf8_lossy(&line).trim_end().to_string());
    }
    Vec::from(tail).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::display::{FixedGeometry, Region};
    use crate::capture::{exit_channel, ExitReceiver};

    fn request(index: u32) -> SegmentRequest {
        SegmentRequest {
            index,
            file_path: PathBuf::from(format!("/videos/swiftcap_1_segment_{}.mp4", index)),
            audio: true,
        }
    }

    #[test]
    fn test_capture_args_defaults() {
        let args = capture_args(&request(1), &RecordingConfig::default(), Some("1920x1080"));
        assert_eq!(
            args,
            vec![
                "record",
                "--out",
                "/videos/swiftcap_1_segment_1.mp4",
                "--audio",
                "on",
                "--cursor",
                "on",
                "--fps",
                "30",
                "--bitrate",
                "4000",
                "--container",
                "mp4",
                "--region",
                "1920x1080",
            ]
        );
    }

    #[test]
    fn test_capture_args_optional_flags() {
        let recording = RecordingConfig {
            cursor: false,
            container: "mkv".to_string(),
            max_duration_seconds: 600,
            threads: 2,
            qp: 23,
            nice: 10,
            ..RecordingConfig::default()
        };
        let mut req = request(3);
        req.audio = false;

        let args = capture_args(&req, &recording, None);
        let joined = args.join(" ");
        assert!(joined.contains("--audio off"));
        assert!(joined.contains("--cursor off"));
        assert!(joined.contains("--container mkv"));
        assert!(joined.contains("--max-dur 600"));
        assert!(joined.contains("--threads 2"));
        assert!(joined.contains("--qp 23"));
        assert!(joined.contains("--nice 10"));
        assert!(!joined.contains("--region"));
    }

    #[tokio::test]
    async fn test_stderr_tail_keeps_last_lines() {
        let text: String = (0..5000).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(text.as_bytes()).await;
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.starts_with("line 4980"));
        assert!(tail.ends_with("line 4999"));
    }

    #[tokio::test]
    async fn test_stderr_tail_short_and_non_utf8() {
        let tail = stderr_tail(&b"bad \xff byte\r\nlast"[..]).await;
        assert_eq!(tail, "bad \u{fffd} byte\nlast");
    }

    fn manager_with_cli(cli: &str, stop_timeout: Duration) -> (SegmentProcessManager, ExitReceiver) {
        let (tx, rx) = exit_channel();
        let manager = SegmentProcessManager::new(
            CaptureOptions {
                cli_path: Some(cli.to_string()),
                recording: RecordingConfig::default(),
                stop_timeout,
            },
            Box::new(FixedGeometry(Region {
                width: 800,
                height: 600,
            })),
            tx,
        );
        (manager, rx)
    }

    #[tokio::test]
    async fn test_spawn_fails_without_cli() {
        let (mut manager, _rx) = manager_with_cli("/nonexistent/swiftcap", Duration::from_secs(1));
        let err = manager.spawn_segment(&request(1)).await.unwrap_err();
        assert!(matches!(err, CaptureError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_request_stop_unknown_handle() {
        let (mut manager, _rx) = manager_with_cli("/nonexistent/swiftcap", Duration::from_secs(1));
        let handle = ProcessHandle {
            pid: 1,
            segment_index: 1,
        };
        assert!(matches!(
            manager.request_stop(&handle),
            Err(CaptureError::NotRunning(_))
        ));
    }

    #[cfg(unix)]
    fn write_script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("swiftcap");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_stop_reports_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = write_script(
            dir.path(),
            "trap 'exit 0' INT\nwhile true; do sleep 0.1; done",
        );
        let (mut manager, mut rx) = manager_with_cli(cli.to_str().unwrap(), Duration::from_secs(5));

        let handle = manager.spawn_segment(&request(1)).await.unwrap();
        assert_eq!(handle.segment_index, 1);

        // give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.request_stop(&handle).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.handle, handle);
        assert_eq!(exit.exit_code, Some(0));
        assert!(!exit.forced);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ignored_interrupt_escalates_to_kill() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = write_script(dir.path(), "trap '' INT\nwhile true; do sleep 0.1; done");
        let (mut manager, mut rx) = manager_with_cli(cli.to_str().unwrap(), Duration::from_secs(1));

        let handle = manager.spawn_segment(&request(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.request_stop(&handle).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.handle, handle);
        assert!(exit.forced);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unrequested_exit_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = write_script(dir.path(), "echo 'no display' >&2\nexit 3");
        let (mut manager, mut rx) = manager_with_cli(cli.to_str().unwrap(), Duration::from_secs(1));

        let handle = manager.spawn_segment(&request(1)).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.handle, handle);
        assert_eq!(exit.exit_code, Some(3));
        assert!(!exit.forced);
    }
}
