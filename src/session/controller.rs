//! The recording session state machine.
//!
//! One task owns the [`Session`] and reacts to three inputs: user commands,
//! capture process exits, and internal notifications (countdown callbacks and
//! the finalize result). The one-second elapsed ticker only exists while the
//! session is recording.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::countdown::{CountdownGate, CountdownHandle};
use super::events::{ErrorKind, SessionEvent};
use super::state::{CommandAck, SegmentRecord, Session, SessionCommand, SessionSnapshot, SessionState};
use crate::capture::{CaptureBackend, ExitReceiver, ProcessExit, ProcessHandle, SegmentRequest};
use crate::concat::{self, ConcatenationPipeline, FinalizeReport};
use crate::config::Config;
use crate::global;

const ELAPSED_TICK: Duration = Duration::from_secs(1);
/// Extra time on top of the stop timeout for the kill escalation to report.
const EXIT_GRACE: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub countdown_seconds: u32,
    pub audio: bool,
    /// Extension for segments and the merged output
    pub extension: String,
    /// Explicit videos directory; resolved from the environment when `None`
    pub videos_dir: Option<String>,
    pub stop_timeout: Duration,
}

impl ControllerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            countdown_seconds: config.recording.countdown_seconds,
            audio: config.recording.audio,
            extension: config.recording.extension().to_string(),
            videos_dir: config.output.videos_dir_override().map(str::to_string),
            stop_timeout: config.capture.stop_timeout(),
        }
    }
}

enum Request {
    Command {
        command: SessionCommand,
        ack: oneshot::Sender<CommandAck>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

struct FinalizeFailure {
    kind: ErrorKind,
    message: String,
}

enum Internal {
    CountdownTick { session: Uuid, remaining: u32 },
    CountdownCancelled { session: Uuid },
    CountdownCompleted { session: Uuid },
    Finalized {
        session: Uuid,
        result: Result<FinalizeReport, FinalizeFailure>,
    },
}

/// Cloneable entry point for the presentation layer.
#[derive(Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<SessionEvent>,
}

impl ControllerHandle {
    /// Send a command and wait for the controller to accept or reject it.
    pub async fn dispatch(&self, command: SessionCommand) -> Result<CommandAck> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.requests
            .send(Request::Command {
                command,
                ack: ack_tx,
            })
            .await
            .map_err(|_| anyhow!("Session controller is not running"))?;
        ack_rx
            .await
            .context("Session controller dropped the command")
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(Request::Snapshot(reply_tx))
            .await
            .map_err(|_| anyhow!("Session controller is not running"))?;
        reply_rx
            .await
            .context("Session controller dropped the snapshot request")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

pub struct SessionController {
    options: ControllerOptions,
    backend: Box<dyn CaptureBackend>,
    pipeline: ConcatenationPipeline,
    session: Session,
    requests: mpsc::Receiver<Request>,
    exits: ExitReceiver,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<SessionEvent>,
    countdown: Option<CountdownHandle>,
    countdown_remaining: Option<u32>,
    ticker: Option<Interval>,
    videos_dir: PathBuf,
    segment_stem: String,
    last_output: Option<PathBuf>,
    last_error: Option<String>,
}

impl SessionController {
    /// `exits` must be the receiving end of the channel `backend` reports on.
    pub fn new(
        options: ControllerOptions,
        backend: Box<dyn CaptureBackend>,
        pipeline: ConcatenationPipeline,
        exits: ExitReceiver,
    ) -> (Self, ControllerHandle) {
        let (request_tx, requests) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = ControllerHandle {
            requests: request_tx,
            events: events.clone(),
        };

        let controller = Self {
            options,
            backend,
            pipeline,
            session: Session::default(),
            requests,
            exits,
            internal_tx,
            internal_rx,
            events,
            countdown: None,
            countdown_remaining: None,
            ticker: None,
            videos_dir: PathBuf::new(),
            segment_stem: String::new(),
            last_output: None,
            last_error: None,
        };

        (controller, handle)
    }

    /// Process inputs until every [`ControllerHandle`] is dropped.
    pub async fn run(mut self) {
        info!("Session controller running");

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(exit) = self.exits.recv() => self.handle_exit(exit),
                Some(message) = self.internal_rx.recv() => self.handle_internal(message).await,
                _ = next_tick(self.ticker.as_mut()) => self.on_elapsed_tick(),
            }
        }

        self.shutdown().await;
    }

    async fn handle_request(&mut self, request: Request) {
        let (command, ack) = match request {
            Request::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                return;
            }
            Request::Command { command, ack } => (command, ack),
        };

        let state = self.session.state;
        if !command.allowed_in(state) {
            warn!("Rejected {} while {}", command, state);
            let _ = ack.send(CommandAck::Rejected { state });
            self.emit(SessionEvent::PreconditionFailed { command, state });
            return;
        }

        // the videos dir must exist before Start is acknowledged
        let videos_dir = if command == SessionCommand::Start {
            match global::ensure_videos_dir(self.options.videos_dir.as_deref()) {
                Ok(dir) => Some(dir),
                Err(e) => {
                    let kind = ErrorKind::FilesystemFailure;
                    let message = format!("{:#}", e);
                    let _ = ack.send(CommandAck::Failed {
                        kind,
                        message: message.clone(),
                    });
                    self.fail(kind, message);
                    return;
                }
            }
        } else {
            None
        };

        let _ = ack.send(CommandAck::Accepted);

        match command {
            SessionCommand::Start => {
                if let Some(dir) = videos_dir {
                    self.start(dir);
                }
            }
            SessionCommand::CancelCountdown => self.cancel_countdown(),
            SessionCommand::Pause => self.pause().await,
            SessionCommand::Resume => self.resume().await,
            SessionCommand::Stop => self.stop().await,
        }
    }

    fn start(&mut self, videos_dir: PathBuf) {
        let stamp = Local::now().timestamp_millis();
        self.session = Session::begin();
        self.session.manifest_path =
            Some(videos_dir.join(format!("swiftcap_concat_{}.txt", stamp)));
        self.segment_stem = format!("swiftcap_{}", stamp);
        self.videos_dir = videos_dir;
        self.last_error = None;

        info!(
            "Session {} counting down from {}s",
            self.session.id, self.options.countdown_seconds
        );
        self.emit(SessionEvent::StateChanged {
            state: SessionState::CountingDown,
        });

        let id = self.session.id;
        let tick_tx = self.internal_tx.clone();
        let cancel_tx = self.internal_tx.clone();
        let complete_tx = self.internal_tx.clone();

        self.countdown_remaining = Some(self.options.countdown_seconds);
        self.countdown = Some(CountdownGate::start(
            self.options.countdown_seconds,
            move |remaining| {
                let _ = tick_tx.send(Internal::CountdownTick {
                    session: id,
                    remaining,
                });
            },
            move || {
                let _ = cancel_tx.send(Internal::CountdownCancelled { session: id });
            },
            move || {
                let _ = complete_tx.send(Internal::CountdownCompleted { session: id });
            },
        ));
    }

    fn cancel_countdown(&mut self) {
        if let Some(mut countdown) = self.countdown.take() {
            countdown.cancel();
        }
        info!("Countdown cancelled, discarding session {}", self.session.id);
        self.reset_to_idle();
    }

    async fn pause(&mut self) {
        self.ticker = None;
        if let Some(handle) = self.session.live_handle() {
            self.stop_capture(handle).await;
        }

        self.session.state = SessionState::Paused;
        info!(
            "Paused after {}s ({} segment(s))",
            self.session.elapsed_seconds,
            self.session.segments.len()
        );
        self.emit(SessionEvent::StateChanged {
            state: SessionState::Paused,
        });
    }

    async fn resume(&mut self) {
        match self.spawn_next_segment().await {
            Ok(()) => self.begin_recording(),
            Err(message) => {
                self.fail(ErrorKind::ProcessSpawnFailure, message);
                self.reset_to_idle();
            }
        }
    }

    async fn stop(&mut self) {
        self.ticker = None;
        if let Some(handle) = self.session.live_handle() {
            self.stop_capture(handle).await;
        }

        let output = concat::output_path(&self.videos_dir, Local::now(), &self.options.extension);
        let manifest = self
            .session
            .manifest_path
            .clone()
            .unwrap_or_else(|| self.videos_dir.join(format!("{}_concat.txt", self.segment_stem)));
        let segments = self.session.segment_paths();

        self.session.state = SessionState::Finalizing;
        info!(
            "Finalizing session {}: {} segment(s) -> {:?}",
            self.session.id,
            segments.len(),
            output
        );
        self.emit(SessionEvent::StateChanged {
            state: SessionState::Finalizing,
        });

        let pipeline = self.pipeline.clone();
        let session = self.session.id;
        let done_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || {
                pipeline.finalize(&segments, &manifest, &output)
            })
            .await;

            let result = match joined {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(e)) => Err(FinalizeFailure {
                    kind: e.kind(),
                    message: e.to_string(),
                }),
                Err(e) => Err(FinalizeFailure {
                    kind: ErrorKind::ConcatenationFailure,
                    message: format!("finalize task failed: {}", e),
                }),
            };
            let _ = done_tx.send(Internal::Finalized { session, result });
        });
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::CountdownTick { session, remaining } => {
                if !self.is_counting_down(session) {
                    debug!("Ignoring stale countdown tick ({})", remaining);
                    return;
                }
                self.countdown_remaining = Some(remaining);
                self.emit(SessionEvent::CountdownTick { remaining });
            }
            Internal::CountdownCancelled { session } => {
                if self.is_counting_down(session) {
                    info!("Countdown aborted, discarding session {}", session);
                    self.countdown = None;
                    self.reset_to_idle();
                }
            }
            Internal::CountdownCompleted { session } => {
                if !self.is_counting_down(session) {
                    debug!("Ignoring completion of stale countdown");
                    return;
                }
                self.countdown = None;
                self.countdown_remaining = None;
                match self.spawn_next_segment().await {
                    Ok(()) => self.begin_recording(),
                    Err(message) => {
                        self.fail(ErrorKind::ProcessSpawnFailure, message);
                        self.reset_to_idle();
                    }
                }
            }
            Internal::Finalized { session, result } => {
                if session != self.session.id || self.session.state != SessionState::Finalizing {
                    debug!("Ignoring finalize result for stale session {}", session);
                    return;
                }
                self.finish(result);
            }
        }
    }

    fn finish(&mut self, result: Result<FinalizeReport, FinalizeFailure>) {
        match result {
            Ok(report) => {
                if !report.missing.is_empty() {
                    let missing: Vec<String> = report
                        .missing
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect();
                    self.fail(
                        ErrorKind::MissingSegmentFile,
                        format!("recording saved without: {}", missing.join(", ")),
                    );
                }
                for warning in report.cleanup_warnings {
                    self.fail(ErrorKind::FilesystemFailure, warning);
                }

                info!("Recording saved to {:?}", report.output);
                self.last_output = Some(report.output.clone());
                self.emit(SessionEvent::RecordingSaved {
                    path: report.output,
                });
            }
            Err(failure) => {
                self.fail(
                    failure.kind,
                    format!(
                        "{} (segments kept in {:?})",
                        failure.message, self.videos_dir
                    ),
                );
            }
        }
        self.reset_to_idle();
    }

    fn handle_exit(&mut self, exit: ProcessExit) {
        if self.session.live_handle() != Some(exit.handle) {
            debug!("Ignoring exit of {} (not the live capture)", exit.handle);
            return;
        }

        self.session.clear_handles();
        self.ticker = None;
        self.fail(
            ErrorKind::UnexpectedProcessExit,
            format!(
                "capture {} exited with code {:?} while recording",
                exit.handle, exit.exit_code
            ),
        );
        self.reset_to_idle();
    }

    fn on_elapsed_tick(&mut self) {
        if self.session.state != SessionState::Recording {
            self.ticker = None;
            return;
        }
        self.session.elapsed_seconds += 1;
        self.session.ticks_since_resume += 1;
        self.emit(SessionEvent::ElapsedTick {
            seconds: self.session.elapsed_seconds,
        });
    }

    /// Start the capture process for the next segment and record it.
    async fn spawn_next_segment(&mut self) -> std::result::Result<(), String> {
        let index = self.session.next_segment_index();
        let file_path = self.videos_dir.join(format!(
            "{}_segment_{}.{}",
            self.segment_stem, index, self.options.extension
        ));
        let request = SegmentRequest {
            index,
            file_path: file_path.clone(),
            audio: self.options.audio,
        };

        let handle = self
            .backend
            .spawn_segment(&request)
            .await
            .map_err(|e| e.to_string())?;

        self.session.segments.push(SegmentRecord {
            index,
            file_path,
            process: Some(handle),
        });
        Ok(())
    }

    fn begin_recording(&mut self) {
        self.session.state = SessionState::Recording;
        self.session.ticks_since_resume = 0;
        self.ticker = Some(interval_at(Instant::now() + ELAPSED_TICK, ELAPSED_TICK));
        info!(
            "Recording segment {}",
            self.session.next_segment_index().saturating_sub(1)
        );
        self.emit(SessionEvent::StateChanged {
            state: SessionState::Recording,
        });
    }

    /// Interrupt a capture and wait, bounded, for its exit report.
    async fn stop_capture(&mut self, handle: ProcessHandle) {
        if let Err(e) = self.backend.request_stop(&handle) {
            warn!("Stop request for {} failed: {}", handle, e);
        }

        match self.await_exit(handle).await {
            Some(exit) if exit.forced => {
                warn!("Capture {} had to be killed; its file may be truncated", handle)
            }
            Some(exit) => debug!("Capture {} finished with code {:?}", handle, exit.exit_code),
            None => warn!("Gave up waiting for {} to exit", handle),
        }

        for segment in &mut self.session.segments {
            if segment.process == Some(handle) {
                segment.process = None;
            }
        }
    }

    async fn await_exit(&mut self, handle: ProcessHandle) -> Option<ProcessExit> {
        let exits = &mut self.exits;
        let wait = async {
            while let Some(exit) = exits.recv().await {
                if exit.handle == handle {
                    return Some(exit);
                }
                debug!("Ignoring exit of {} while waiting on {}", exit.handle, handle);
            }
            None
        };

        tokio::time::timeout(exit_wait(self.options.stop_timeout), wait)
            .await
            .ok()
            .flatten()
    }

    fn is_counting_down(&self, session: Uuid) -> bool {
        session == self.session.id && self.session.state == SessionState::CountingDown
    }

    /// Discard the current session and return to Idle.
    fn reset_to_idle(&mut self) {
        self.countdown = None;
        self.countdown_remaining = None;
        self.ticker = None;

        if let Some(handle) = self.session.clear_handles() {
            warn!("Dropping session with a live capture {}, stopping it", handle);
            let _ = self.backend.request_stop(&handle);
        }

        let was = self.session.state;
        self.session = Session::default();
        if was != SessionState::Idle {
            self.emit(SessionEvent::StateChanged {
                state: SessionState::Idle,
            });
        }
    }

    fn fail(&mut self, kind: ErrorKind, message: String) {
        error!("{}: {}", kind, message);
        self.last_error = Some(format!("{}: {}", kind, message));
        self.emit(SessionEvent::error(kind, message));
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        let state = self.session.state;
        SessionSnapshot {
            state,
            session_id: (state != SessionState::Idle).then(|| self.session.id.to_string()),
            elapsed_seconds: self.session.elapsed_seconds,
            segment_count: self.session.segments.len(),
            recording: state == SessionState::Recording,
            paused: state == SessionState::Paused,
            ticks_since_resume: self.session.ticks_since_resume,
            countdown_remaining: self.countdown_remaining,
            last_output: self.last_output.clone(),
            last_error: self.last_error.clone(),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.session.live_handle() {
            info!("Controller shutting down, stopping {}", handle);
            self.stop_capture(handle).await;
        }
        info!("Session controller stopped");
    }
}

/// How long to wait for a stopped capture to report its exit.
fn exit_wait(stop_timeout: Duration) -> Duration {
    stop_timeout.saturating_add(EXIT_GRACE)
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
