//! End-to-end session lifecycle against fake capture and concat backends.
//!
//! Time is paused so countdown and elapsed ticks are deterministic.

use async_trait::async_trait;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use swiftcap_recorder::capture::{
    exit_channel, CaptureBackend, CaptureError, ExitSender, ProcessExit, ProcessHandle,
    SegmentRequest,
};
use swiftcap_recorder::concat::{ConcatTool, ConcatenationPipeline, ToolOutput};
use swiftcap_recorder::session::{
    CommandAck, ControllerHandle, ControllerOptions, ErrorKind, SessionCommand, SessionController,
    SessionEvent, SessionState,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct CaptureLog {
    spawned: Vec<SegmentRequest>,
    stopped: Vec<ProcessHandle>,
    live: Option<ProcessHandle>,
    overlaps: usize,
}

/// Writes the segment file on spawn and reports a clean exit on stop.
struct FakeCapture {
    exits: ExitSender,
    log: Arc<Mutex<CaptureLog>>,
    fail_index: Option<u32>,
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn spawn_segment(
        &mut self,
        request: &SegmentRequest,
    ) -> Result<ProcessHandle, CaptureError> {
        if self.fail_index == Some(request.index) {
            return Err(CaptureError::Launch {
                index: request.index,
                source: io::Error::new(io::ErrorKind::NotFound, "swiftcap: not found"),
            });
        }

        std::fs::write(&request.file_path, format!("segment {};", request.index)).unwrap();

        let handle = ProcessHandle {
            pid: 4000 + request.index,
            segment_index: request.index,
        };
        let mut log = self.log.lock().unwrap();
        if log.live.is_some() {
            log.overlaps += 1;
        }
        log.live = Some(handle);
        log.spawned.push(request.clone());
        Ok(handle)
    }

    fn request_stop(&mut self, handle: &ProcessHandle) -> Result<(), CaptureError> {
        let mut log = self.log.lock().unwrap();
        if log.live != Some(*handle) {
            return Err(CaptureError::NotRunning(*handle));
        }
        log.live = None;
        log.stopped.push(*handle);
        self.exits
            .send(ProcessExit {
                handle: *handle,
                exit_code: Some(0),
                forced: false,
            })
            .unwrap();
        Ok(())
    }
}

/// Concatenates the listed files byte for byte.
#[derive(Default)]
struct FakeConcat {
    fail: bool,
    calls: Mutex<usize>,
    /// When set, `run` blocks until the sender side signals or drops
    hold: Mutex<Option<std_mpsc::Receiver<()>>>,
}

impl ConcatTool for FakeConcat {
    fn command_line(&self, manifest: &Path, output: &Path) -> String {
        format!("fake-concat -i {} {}", manifest.display(), output.display())
    }

    fn run(&self, manifest: &Path, output: &Path) -> io::Result<ToolOutput> {
        *self.calls.lock().unwrap() += 1;
        if let Some(hold) = self.hold.lock().unwrap().take() {
            let _ = hold.recv();
        }
        if self.fail {
            return Ok(ToolOutput {
                success: false,
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "Invalid data found when processing input".to_string(),
            });
        }

        let mut merged = Vec::new();
        for line in std::fs::read_to_string(manifest)?.lines() {
            let path = line.trim_start_matches("file '").trim_end_matches('\'');
            merged.extend(std::fs::read(path)?);
        }
        std::fs::write(output, merged)?;
        Ok(ToolOutput {
            success: true,
            exit_code: Some(0),
            ..ToolOutput::default()
        })
    }
}

struct Harness {
    handle: ControllerHandle,
    events: broadcast::Receiver<SessionEvent>,
    log: Arc<Mutex<CaptureLog>>,
    exits: ExitSender,
    concat: Arc<FakeConcat>,
    _dir: TempDir,
    dir: PathBuf,
}

fn harness(countdown_seconds: u32, fail_index: Option<u32>, concat: FakeConcat) -> Harness {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();
    let (exit_tx, exit_rx) = exit_channel();
    let log = Arc::new(Mutex::new(CaptureLog::default()));
    let concat = Arc::new(concat);

    let (controller, handle) = SessionController::new(
        ControllerOptions {
            countdown_seconds,
            audio: true,
            extension: "mp4".to_string(),
            videos_dir: Some(path.to_string_lossy().to_string()),
            stop_timeout: Duration::from_secs(5),
        },
        Box::new(FakeCapture {
            exits: exit_tx.clone(),
            log: log.clone(),
            fail_index,
        }),
        ConcatenationPipeline::new(concat.clone()),
        exit_rx,
    );
    let events = handle.subscribe();
    tokio::spawn(controller.run());

    Harness {
        handle,
        events,
        log,
        exits: exit_tx,
        concat,
        _dir: dir,
        dir: path,
    }
}

impl Harness {
    async fn send(&self, command: SessionCommand) -> CommandAck {
        self.handle.dispatch(command).await.unwrap()
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    /// Collect events up to and including the first one matching `done`.
    async fn until(&mut self, done: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let finished = done(&event);
            seen.push(event);
            if finished {
                return seen;
            }
        }
    }

    async fn until_state(&mut self, state: SessionState) -> Vec<SessionEvent> {
        self.until(|e| *e == SessionEvent::StateChanged { state })
            .await
    }

    async fn elapsed_ticks(&mut self, count: usize) -> Vec<u64> {
        let mut ticks = Vec::new();
        while ticks.len() < count {
            if let SessionEvent::ElapsedTick { seconds } = self.next_event().await {
                ticks.push(seconds);
            }
        }
        ticks
    }

    fn spawned_indices(&self) -> Vec<u32> {
        self.log
            .lock()
            .unwrap()
            .spawned
            .iter()
            .map(|r| r.index)
            .collect()
    }

    fn segment_files(&self) -> Vec<PathBuf> {
        self.log
            .lock()
            .unwrap()
            .spawned
            .iter()
            .map(|r| r.file_path.clone())
            .collect()
    }

    fn files_in_dir(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

fn errors(events: &[SessionEvent]) -> Vec<ErrorKind> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn full_session_with_pause_and_resume() {
    let mut h = harness(3, None, FakeConcat::default());

    assert_eq!(h.send(SessionCommand::Start).await, CommandAck::Accepted);

    let events = h.until_state(SessionState::Recording).await;
    assert_eq!(
        events[0],
        SessionEvent::StateChanged {
            state: SessionState::CountingDown
        }
    );
    let countdown: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::CountdownTick { remaining } => Some(*remaining),
            _ => None,
        })
        .collect();
    assert_eq!(countdown, vec![3, 2, 1]);
    assert_eq!(h.spawned_indices(), vec![1]);

    assert_eq!(h.elapsed_ticks(10).await, (1..=10).collect::<Vec<u64>>());

    assert_eq!(h.send(SessionCommand::Pause).await, CommandAck::Accepted);
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Paused);
    assert!(snapshot.paused);
    assert_eq!(snapshot.elapsed_seconds, 10);
    assert_eq!(snapshot.segment_count, 1);

    // frozen while paused
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.handle.snapshot().await.unwrap().elapsed_seconds, 10);

    assert_eq!(h.send(SessionCommand::Resume).await, CommandAck::Accepted);
    assert_eq!(h.elapsed_ticks(5).await, (11..=15).collect::<Vec<u64>>());

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.recording);
    assert_eq!(snapshot.segment_count, 2);
    assert_eq!(snapshot.ticks_since_resume, 5);
    assert_eq!(h.spawned_indices(), vec![1, 2]);

    let segments = h.segment_files();
    assert_eq!(h.send(SessionCommand::Stop).await, CommandAck::Accepted);
    let events = h.until_state(SessionState::Idle).await;

    assert!(events.contains(&SessionEvent::StateChanged {
        state: SessionState::Finalizing
    }));
    assert!(errors(&events).is_empty(), "unexpected errors: {:?}", events);
    let saved = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::RecordingSaved { path } => Some(path.clone()),
            _ => None,
        })
        .expect("no RecordingSaved event");

    let name = saved.file_name().unwrap().to_string_lossy().to_string();
    assert!(
        Regex::new(r"^recording_\d{8}_\d{6}\.mp4$").unwrap().is_match(&name),
        "unexpected output name {}",
        name
    );
    assert_eq!(
        std::fs::read_to_string(&saved).unwrap(),
        "segment 1;segment 2;"
    );
    assert!(segments.iter().all(|p| !p.exists()));
    assert_eq!(h.files_in_dir(), vec![name]);
    assert_eq!(*h.concat.calls.lock().unwrap(), 1);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.elapsed_seconds, 0);
    assert_eq!(snapshot.segment_count, 0);
    assert_eq!(snapshot.last_output, Some(saved));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_countdown_spawns_nothing() {
    let mut h = harness(5, None, FakeConcat::default());

    h.send(SessionCommand::Start).await;
    h.until(|e| *e == SessionEvent::CountdownTick { remaining: 4 })
        .await;

    assert_eq!(
        h.send(SessionCommand::CancelCountdown).await,
        CommandAck::Accepted
    );
    h.until_state(SessionState::Idle).await;

    // the countdown must not complete later on
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.segment_count, 0);
    assert!(h.spawned_indices().is_empty());
    while let Ok(event) = h.events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::StateChanged { state: SessionState::Recording }),
            "recording started after cancel"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn first_spawn_failure_returns_to_idle() {
    let mut h = harness(1, Some(1), FakeConcat::default());

    h.send(SessionCommand::Start).await;
    let events = h.until_state(SessionState::Idle).await;

    assert_eq!(errors(&events), vec![ErrorKind::ProcessSpawnFailure]);
    assert!(!events.contains(&SessionEvent::StateChanged {
        state: SessionState::Recording
    }));
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.segment_count, 0);
}

#[tokio::test(start_paused = true)]
async fn pause_while_idle_is_rejected() {
    let mut h = harness(3, None, FakeConcat::default());

    assert_eq!(
        h.send(SessionCommand::Pause).await,
        CommandAck::Rejected {
            state: SessionState::Idle
        }
    );
    assert_eq!(
        h.next_event().await,
        SessionEvent::PreconditionFailed {
            command: SessionCommand::Pause,
            state: SessionState::Idle
        }
    );
    assert_eq!(h.handle.snapshot().await.unwrap().state, SessionState::Idle);

    // controller keeps serving after a rejection
    assert_eq!(h.send(SessionCommand::Start).await, CommandAck::Accepted);
}

#[tokio::test(start_paused = true)]
async fn resume_failure_keeps_earlier_segments_on_disk() {
    let mut h = harness(0, Some(2), FakeConcat::default());

    h.send(SessionCommand::Start).await;
    h.until_state(SessionState::Recording).await;
    h.send(SessionCommand::Pause).await;
    h.until_state(SessionState::Paused).await;

    h.send(SessionCommand::Resume).await;
    let events = h.until_state(SessionState::Idle).await;

    assert_eq!(errors(&events), vec![ErrorKind::ProcessSpawnFailure]);
    assert_eq!(h.spawned_indices(), vec![1]);
    assert!(h.segment_files()[0].exists());
}

#[tokio::test(start_paused = true)]
async fn unexpected_exit_while_recording() {
    let mut h = harness(0, None, FakeConcat::default());

    h.send(SessionCommand::Start).await;
    h.until_state(SessionState::Recording).await;
    h.elapsed_ticks(2).await;

    h.exits
        .send(ProcessExit {
            handle: ProcessHandle {
                pid: 4001,
                segment_index: 1,
            },
            exit_code: Some(1),
            forced: false,
        })
        .unwrap();

    let events = h.until_state(SessionState::Idle).await;
    assert_eq!(errors(&events), vec![ErrorKind::UnexpectedProcessExit]);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot
        .last_error
        .unwrap()
        .starts_with("unexpected_process_exit"));
    assert!(h.segment_files()[0].exists());
}

#[tokio::test(start_paused = true)]
async fn stale_exit_is_ignored() {
    let mut h = harness(0, None, FakeConcat::default());

    h.send(SessionCommand::Start).await;
    h.until_state(SessionState::Recording).await;

    h.exits
        .send(ProcessExit {
            handle: ProcessHandle {
                pid: 9999,
                segment_index: 7,
            },
            exit_code: Some(0),
            forced: false,
        })
        .unwrap();

    h.elapsed_ticks(1).await;
    assert_eq!(
        h.handle.snapshot().await.unwrap().state,
        SessionState::Recording
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_pause_resume_numbers_segments_without_gaps() {
    let mut h = harness(0, None, FakeConcat::default());

    h.send(SessionCommand::Start).await;
    h.until_state(SessionState::Recording).await;
    for _ in 0..3 {
        h.elapsed_ticks(1).await;
        assert_eq!(h.send(SessionCommand::Pause).await, CommandAck::Accepted);
        assert_eq!(h.send(SessionCommand::Resume).await, CommandAck::Accepted);
    }
    assert_eq!(h.send(SessionCommand::Pause).await, CommandAck::Accepted);
    assert_eq!(h.send(SessionCommand::Stop).await, CommandAck::Accepted);

    let events = h.until_state(SessionState::Idle).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::RecordingSaved { .. })));

    assert_eq!(h.spawned_indices(), vec![1, 2, 3, 4]);
    let log = h.log.lock().unwrap();
    assert_eq!(log.overlaps, 0);
    assert_eq!(log.stopped.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn concat_failure_keeps_segments() {
    let mut h = harness(
        0,
        None,
        FakeConcat {
            fail: true,
            ..FakeConcat::default()
        },
    );

    h.send(SessionCommand::Start).await;
    h.until_state(SessionState::Recording).await;
    h.send(SessionCommand::Stop).await;

    let events = h.until_state(SessionState::Idle).await;
    assert_eq!(errors(&events), vec![ErrorKind::ConcatenationFailure]);
    let message = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(message.contains("fake-concat"));
    assert!(message.contains("Invalid data found"));

    assert!(h.segment_files().iter().all(|p| p.exists()));
    assert!(h.files_in_dir().iter().any(|n| n.ends_with(".txt")));
}

#[tokio::test(start_paused = true)]
async fn commands_during_finalize_are_rejected() {
    let (release, hold) = std_mpsc::channel();
    let mut h = harness(
        0,
        None,
        FakeConcat {
            hold: Mutex::new(Some(hold)),
            ..FakeConcat::default()
        },
    );

    h.send(SessionCommand::Start).await;
    h.until_state(SessionState::Recording).await;
    h.send(SessionCommand::Stop).await;
    h.until_state(SessionState::Finalizing).await;

    for command in [SessionCommand::Start, SessionCommand::Pause, SessionCommand::Stop] {
        assert_eq!(
            h.send(command).await,
            CommandAck::Rejected {
                state: SessionState::Finalizing
            }
        );
    }

    release.send(()).unwrap();
    let events = h.until_state(SessionState::Idle).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::RecordingSaved { .. })));
}

#[tokio::test(start_paused = true)]
async fn missing_segment_at_stop_still_saves_the_rest() {
    let mut h = harness(0, None, FakeConcat::default());

    h.send(SessionCommand::Start).await;
    h.until_state(SessionState::Recording).await;
    assert_eq!(h.send(SessionCommand::Pause).await, CommandAck::Accepted);
    assert_eq!(h.send(SessionCommand::Resume).await, CommandAck::Accepted);
    h.until_state(SessionState::Recording).await;

    let segments = h.segment_files();
    assert_eq!(segments.len(), 2);
    std::fs::remove_file(&segments[0]).unwrap();

    assert_eq!(h.send(SessionCommand::Stop).await, CommandAck::Accepted);
    let events = h.until_state(SessionState::Idle).await;

    assert_eq!(errors(&events), vec![ErrorKind::MissingSegmentFile]);
    let error_at = events
        .iter()
        .position(|e| matches!(e, SessionEvent::Error { .. }))
        .unwrap();
    let saved_at = events
        .iter()
        .position(|e| matches!(e, SessionEvent::RecordingSaved { .. }))
        .expect("no RecordingSaved event");
    assert!(error_at < saved_at);

    match &events[error_at] {
        SessionEvent::Error { message, .. } => {
            assert!(message.contains(&segments[0].display().to_string()))
        }
        _ => unreachable!(),
    }
    let saved = match &events[saved_at] {
        SessionEvent::RecordingSaved { path } => path.clone(),
        _ => unreachable!(),
    };
    assert_eq!(std::fs::read_to_string(&saved).unwrap(), "segment 2;");
    assert!(!segments[1].exists());

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.last_output, Some(saved));
    assert!(snapshot
        .last_error
        .unwrap()
        .starts_with("missing_segment_file"));
}
