// Process supervisor
//
// Owns the subprocess of one shared stream. For TS the process writes
// MPEG-TS to stdout and the supervisor forwards it in packet-aligned chunks;
// for HLS the process writes files and the supervisor only watches the
// manifest for progress.
//
// Failure policy for one source:
// - spawn error or no output at all        -> SourceUnreachable
// - output stopped for the stall window    -> StreamStalled
// - process exited                         -> respawn with backoff, up to
//                                             max_respawns, then ProcessCrashed
// The caller (the stream driver) decides what happens after that.

pub mod command;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing as log;
use tvrelay_core::config::StreamingConfig;

use crate::error::{StreamError, StreamResult};

pub use self::command::{ProcessCommand, SourceTarget};

/// MPEG-TS packet size. Chunks handed to the buffer are always whole packets.
pub const TS_PACKET_SIZE: usize = 188;

const MAX_DIAGNOSTIC_LINES: usize = 32;

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Spawned { pid: Option<u32>, attempt: u32 },
    /// A chunk of TS output.
    Data(Bytes),
    /// The HLS manifest changed.
    Progress,
    Exited { code: Option<i32> },
}

/// Receives everything the supervisor observes. An error aborts the run.
#[async_trait]
pub trait ProcessObserver: Send {
    async fn on_event(&mut self, event: ProcessEvent) -> StreamResult<()>;
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Cancelled by the caller; the process has been terminated.
    Stopped,
    /// Clean exit of a source that is expected to end.
    Completed,
    Failed(StreamError),
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub chunk_size: usize,
    pub first_byte_timeout: Duration,
    pub stall_timeout: Duration,
    pub max_respawns: u32,
    pub respawn_backoff: Duration,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&StreamingConfig> for SupervisorSettings {
    fn from(config: &StreamingConfig) -> Self {
        // Round the chunk size down to whole packets.
        let chunk_size = (config.chunk_size / TS_PACKET_SIZE).max(1) * TS_PACKET_SIZE;
        Self {
            chunk_size,
            first_byte_timeout: Duration::from_secs(config.first_byte_timeout_seconds),
            stall_timeout: config.stall_timeout(),
            max_respawns: config.max_respawns,
            respawn_backoff: Duration::from_millis(config.respawn_backoff_ms),
            stop_timeout: config.stop_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Process liveness and diagnostics, readable while the supervisor runs.
#[derive(Debug, Default)]
pub struct ProcessState {
    inner: Mutex<ProcessStateInner>,
}

#[derive(Debug, Default)]
struct ProcessStateInner {
    pid: Option<u32>,
    running: bool,
    exit_code: Option<i32>,
    restarts: u32,
    spawns: u64,
    diagnostics: VecDeque<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub pid: Option<u32>,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub restarts: u32,
    pub spawns: u64,
    pub diagnostics: Vec<String>,
}

impl ProcessState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().exit_code
    }

    /// Total processes started over the stream's lifetime.
    #[must_use]
    pub fn spawns(&self) -> u64 {
        self.inner.lock().spawns
    }

    #[must_use]
    pub fn diagnostics(&self) -> Vec<String> {
        self.inner.lock().diagnostics.iter().cloned().collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> ProcessSnapshot {
        let inner = self.inner.lock();
        ProcessSnapshot {
            pid: inner.pid,
            running: inner.running,
            exit_code: inner.exit_code,
            restarts: inner.restarts,
            spawns: inner.spawns,
            diagnostics: inner.diagnostics.iter().cloned().collect(),
        }
    }

    fn mark_spawned(&self, pid: Option<u32>) {
        let mut inner = self.inner.lock();
        inner.pid = pid;
        inner.running = true;
        inner.exit_code = None;
        inner.spawns += 1;
    }

    fn mark_exited(&self, code: Option<i32>) {
        let mut inner = self.inner.lock();
        inner.running = false;
        inner.exit_code = code;
    }

    fn mark_restart(&self) {
        self.inner.lock().restarts += 1;
    }

    fn push_diagnostic(&self, line: String) {
        let mut inner = self.inner.lock();
        if inner.diagnostics.len() == MAX_DIAGNOSTIC_LINES {
            inner.diagnostics.pop_front();
        }
        inner.diagnostics.push_back(line);
    }

    fn last_diagnostic(&self) -> Option<String> {
        self.inner.lock().diagnostics.back().cloned()
    }
}

/// How a single process run ended.
enum AttemptEnd {
    Cancelled,
    SpawnFailed(std::io::Error),
    NoOutput,
    Stalled,
    Exited { code: Option<i32>, produced: bool },
    Observer(StreamError),
}

pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    state: Arc<ProcessState>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, state: Arc<ProcessState>) -> Self {
        Self { settings, state }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// Run `command` against one source until it is cancelled, completes or
    /// fails past its respawn budget. `manifest` is the file to watch when
    /// the process writes HLS instead of stdout.
    pub async fn run(
        &self,
        command: &ProcessCommand,
        manifest: Option<&Path>,
        ends_naturally: bool,
        observer: &mut dyn ProcessObserver,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut attempt = 0u32;
        loop {
            let end = self.run_once(command, manifest, attempt, observer, cancel).await;
            let failure = match end {
                AttemptEnd::Cancelled => return RunOutcome::Stopped,
                AttemptEnd::Exited { code: Some(0), .. } if ends_naturally => {
                    log::info!(program = %command.program, "Process completed");
                    return RunOutcome::Completed;
                }
                AttemptEnd::SpawnFailed(e) => {
                    return RunOutcome::Failed(StreamError::SourceUnreachable(format!(
                        "failed to spawn {}: {e}",
                        command.program
                    )));
                }
                AttemptEnd::NoOutput => {
                    return RunOutcome::Failed(StreamError::SourceUnreachable(self.describe_failure(
                        format!("no output within {:?}", self.settings.first_byte_timeout),
                    )));
                }
                AttemptEnd::Stalled => {
                    return RunOutcome::Failed(StreamError::StreamStalled(self.describe_failure(
                        format!("no output for {:?}", self.settings.stall_timeout),
                    )));
                }
                AttemptEnd::Observer(e) => return RunOutcome::Failed(e),
                AttemptEnd::Exited { code, produced } => {
                    let reason = self.describe_failure(format!("exited with {code:?}"));
                    if produced {
                        StreamError::ProcessCrashed(reason)
                    } else {
                        StreamError::SourceUnreachable(reason)
                    }
                }
            };

            if attempt >= self.settings.max_respawns {
                return RunOutcome::Failed(failure);
            }
            attempt += 1;
            self.state.mark_restart();

            let backoff = self.settings.respawn_backoff * attempt;
            log::warn!(
                program = %command.program,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Process failed, respawning: {}",
                failure
            );
            tokio::select! {
                () = cancel.cancelled() => return RunOutcome::Stopped,
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn describe_failure(&self, reason: String) -> String {
        match self.state.last_diagnostic() {
            Some(line) => format!("{reason} ({line})"),
            None => reason,
        }
    }

    async fn run_once(
        &self,
        command: &ProcessCommand,
        manifest: Option<&Path>,
        attempt: u32,
        observer: &mut dyn ProcessObserver,
        cancel: &CancellationToken,
    ) -> AttemptEnd {
        if cancel.is_cancelled() {
            return AttemptEnd::Cancelled;
        }

        let mut child = match command.to_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!(program = %command.program, error = %e, "Failed to spawn process");
                return AttemptEnd::SpawnFailed(e);
            }
        };

        let pid = child.id();
        self.state.mark_spawned(pid);
        log::info!(
            pid = ?pid,
            attempt,
            command = %command.describe(),
            "Process spawned"
        );

        let stdin = child.stdin.take();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_reader(stderr, Arc::clone(&self.state)));

        if let Err(e) = observer.on_event(ProcessEvent::Spawned { pid, attempt }).await {
            self.terminate(&mut child, stdin).await;
            return AttemptEnd::Observer(e);
        }

        let end = match (child.stdout.take(), manifest) {
            (Some(stdout), _) => {
                self.pump_stdout(&mut child, stdin, stdout, observer, cancel)
                    .await
            }
            (None, Some(manifest)) => {
                self.watch_manifest(&mut child, stdin, manifest.to_path_buf(), observer, cancel)
                    .await
            }
            (None, None) => {
                self.terminate(&mut child, stdin).await;
                AttemptEnd::Observer(StreamError::Internal(
                    "process has neither stdout nor a manifest to watch".to_string(),
                ))
            }
        };

        if let Some(task) = stderr_task {
            // The pipe closes with the process; don't wait on grandchildren.
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        let code = self.state.exit_code();
        log::info!(pid = ?pid, code = ?code, "Process exited");
        if let Err(e) = observer.on_event(ProcessEvent::Exited { code }).await {
            log::warn!(error = %e, "Observer failed on process exit");
        }
        end
    }

    async fn pump_stdout(
        &self,
        child: &mut Child,
        stdin: Option<ChildStdin>,
        mut stdout: ChildStdout,
        observer: &mut dyn ProcessObserver,
        cancel: &CancellationToken,
    ) -> AttemptEnd {
        let chunk_size = self.settings.chunk_size;
        let mut buf = BytesMut::with_capacity(chunk_size * 2);
        let mut produced = false;

        loop {
            buf.reserve(chunk_size);
            let window = if produced {
                self.settings.stall_timeout
            } else {
                self.settings.first_byte_timeout
            };

            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.terminate(child, stdin).await;
                    return AttemptEnd::Cancelled;
                }
                read = tokio::time::timeout(window, stdout.read_buf(&mut buf)) => read,
            };

            match read {
                Err(_) => {
                    self.terminate(child, stdin).await;
                    return if produced {
                        AttemptEnd::Stalled
                    } else {
                        AttemptEnd::NoOutput
                    };
                }
                Ok(Ok(0)) => {
                    // EOF: flush the tail, even if not packet-aligned.
                    if !buf.is_empty() {
                        if let Err(e) = observer.on_event(ProcessEvent::Data(buf.split().freeze())).await {
                            self.terminate(child, stdin).await;
                            return AttemptEnd::Observer(e);
                        }
                        produced = true;
                    }
                    let code = self.wait_exit(child, stdin).await;
                    return AttemptEnd::Exited { code, produced };
                }
                Ok(Ok(_)) => {
                    let aligned = buf.len() / TS_PACKET_SIZE * TS_PACKET_SIZE;
                    let mut ready = buf.split_to(aligned);
                    while !ready.is_empty() {
                        let take = ready.len().min(chunk_size);
                        let chunk = ready.split_to(take).freeze();
                        if let Err(e) = observer.on_event(ProcessEvent::Data(chunk)).await {
                            self.terminate(child, stdin).await;
                            return AttemptEnd::Observer(e);
                        }
                        produced = true;
                    }
                }
                Ok(Err(e)) => {
                    log::warn!(error = %e, "Failed to read process output");
                    let code = self.terminate(child, stdin).await;
                    return AttemptEnd::Exited { code, produced };
                }
            }
        }
    }

    async fn watch_manifest(
        &self,
        child: &mut Child,
        stdin: Option<ChildStdin>,
        manifest: PathBuf,
        observer: &mut dyn ProcessObserver,
        cancel: &CancellationToken,
    ) -> AttemptEnd {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        let mut last_modified: Option<SystemTime> = None;
        let mut last_progress = Instant::now();
        let mut produced = false;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.terminate(child, stdin).await;
                    return AttemptEnd::Cancelled;
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    self.state.mark_exited(code);
                    return AttemptEnd::Exited { code, produced };
                }
                _ = ticker.tick() => {
                    let modified = tokio::fs::metadata(&manifest)
                        .await
                        .ok()
                        .and_then(|m| m.modified().ok());
                    if modified.is_some() && modified != last_modified {
                        last_modified = modified;
                        last_progress = Instant::now();
                        produced = true;
                        if let Err(e) = observer.on_event(ProcessEvent::Progress).await {
                            self.terminate(child, stdin).await;
                            return AttemptEnd::Observer(e);
                        }
                        continue;
                    }

                    let window = if produced {
                        self.settings.stall_timeout
                    } else {
                        self.settings.first_byte_timeout
                    };
                    if last_progress.elapsed() >= window {
                        self.terminate(child, stdin).await;
                        return if produced { AttemptEnd::Stalled } else { AttemptEnd::NoOutput };
                    }
                }
            }
        }
    }

    /// Output ended; give the process the stop window to exit on its own.
    async fn wait_exit(&self, child: &mut Child, stdin: Option<ChildStdin>) -> Option<i32> {
        match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                drop(stdin);
                let code = status.code();
                self.state.mark_exited(code);
                code
            }
            _ => self.terminate(child, stdin).await,
        }
    }

    /// Graceful-then-forceful stop: ask ffmpeg to quit on stdin, wait up to
    /// the stop window, then kill. Returns once the process is reaped.
    async fn terminate(&self, child: &mut Child, stdin: Option<ChildStdin>) -> Option<i32> {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }

        let code = match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => {
                log::warn!(pid = ?child.id(), "Process did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    log::error!(error = %e, "Failed to kill process");
                }
                None
            }
        };
        self.state.mark_exited(code);
        code
    }
}

fn spawn_stderr_reader(stderr: ChildStderr, state: Arc<ProcessState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            log::debug!("process stderr: {}", line);
            state.push_diagnostic(line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collector {
        data: Vec<Bytes>,
        events: Vec<String>,
    }

    #[async_trait]
    impl ProcessObserver for Collector {
        async fn on_event(&mut self, event: ProcessEvent) -> StreamResult<()> {
            match event {
                ProcessEvent::Data(chunk) => self.data.push(chunk),
                ProcessEvent::Spawned { attempt, .. } => self.events.push(format!("spawned:{attempt}")),
                ProcessEvent::Progress => self.events.push("progress".to_string()),
                ProcessEvent::Exited { code } => self.events.push(format!("exited:{code:?}")),
            }
            Ok(())
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            chunk_size: TS_PACKET_SIZE * 4,
            first_byte_timeout: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(1),
            max_respawns: 2,
            respawn_backoff: Duration::from_millis(10),
            stop_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            stdout_output: true,
        }
    }

    #[tokio::test]
    async fn test_output_is_packet_aligned_and_chunked() {
        let supervisor = ProcessSupervisor::new(settings(), Arc::new(ProcessState::new()));
        let mut collector = Collector::default();
        let outcome = supervisor
            .run(
                &sh("head -c 1880 /dev/zero"),
                None,
                true,
                &mut collector,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, RunOutcome::Completed));
        let total: usize = collector.data.iter().map(Bytes::len).sum();
        assert_eq!(total, 1880);
        assert!(collector.data.iter().all(|c| c.len() % TS_PACKET_SIZE == 0));
        assert!(collector.data.iter().all(|c| c.len() <= TS_PACKET_SIZE * 4));
        assert!(!supervisor.state().is_running());
        assert_eq!(supervisor.state().exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_crash_respawns_then_fails() {
        let state = Arc::new(ProcessState::new());
        let supervisor = ProcessSupervisor::new(settings(), Arc::clone(&state));
        let mut collector = Collector::default();
        let outcome = supervisor
            .run(
                &sh("head -c 188 /dev/zero; echo boom >&2; exit 3"),
                None,
                false,
                &mut collector,
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            RunOutcome::Failed(StreamError::ProcessCrashed(reason)) => {
                assert!(reason.contains("boom"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // First run plus two respawns.
        assert_eq!(state.spawns(), 3);
        assert_eq!(state.snapshot().restarts, 2);
        assert_eq!(state.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_live_source_clean_exit_is_a_failure() {
        let supervisor = ProcessSupervisor::new(
            SupervisorSettings {
                max_respawns: 0,
                ..settings()
            },
            Arc::new(ProcessState::new()),
        );
        let outcome = supervisor
            .run(
                &sh("head -c 188 /dev/zero"),
                None,
                false,
                &mut Collector::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, RunOutcome::Failed(StreamError::ProcessCrashed(_))));
    }

    #[tokio::test]
    async fn test_stall_is_detected() {
        let supervisor = ProcessSupervisor::new(settings(), Arc::new(ProcessState::new()));
        let outcome = supervisor
            .run(
                &sh("head -c 376 /dev/zero; sleep 30"),
                None,
                false,
                &mut Collector::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, RunOutcome::Failed(StreamError::StreamStalled(_))));
        assert!(!supervisor.state().is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_unreachable() {
        let supervisor = ProcessSupervisor::new(settings(), Arc::new(ProcessState::new()));
        let command = ProcessCommand {
            program: "/nonexistent/tvrelay-test-binary".to_string(),
            args: Vec::new(),
            stdout_output: true,
        };
        let outcome = supervisor
            .run(&command, None, false, &mut Collector::default(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RunOutcome::Failed(StreamError::SourceUnreachable(_))));
        assert_eq!(supervisor.state().spawns(), 0);
    }

    #[tokio::test]
    async fn test_cancel_terminates_process() {
        let supervisor = Arc::new(ProcessSupervisor::new(settings(), Arc::new(ProcessState::new())));
        let cancel = CancellationToken::new();

        let task = {
            let supervisor = Arc::clone(&supervisor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut collector = Collector::default();
                supervisor
                    .run(
                        &sh("while :; do head -c 188 /dev/zero; sleep 0.05; done"),
                        None,
                        false,
                        &mut collector,
                        &cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(supervisor.state().is_running());
        cancel.cancel();

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped));
        assert!(!supervisor.state().is_running());
    }

    #[tokio::test]
    async fn test_hls_manifest_progress() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("stream.m3u8");
        let command = ProcessCommand {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("echo '#EXTM3U' > {}; sleep 0.2; exit 0", manifest.display()),
            ],
            stdout_output: false,
        };
        let supervisor = ProcessSupervisor::new(settings(), Arc::new(ProcessState::new()));
        let mut collector = Collector::default();
        let outcome = supervisor
            .run(&command, Some(&manifest), true, &mut collector, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, RunOutcome::Completed));
        assert!(collector.events.iter().any(|e| e == "progress"));
    }
}
