//! Shared test harness for the Supervisor scenario tests.
//!
//! Drives the Supervisor against the crate's own mock Process Controller
//! and mock Change Source (gated behind the `test-support` feature, see
//! `Cargo.toml`'s dev-dependency on itself) instead of spawning real
//! subprocesses or touching the filesystem. Grounded on the teacher's
//! `tests/integration_test.rs`, which spins up a real daemon and drives it
//! over a websocket rather than mocking transport — here the transport
//! itself (child stdio) is what's being tested, so it's mocked instead of
//! the protocol layer.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mcpmon::config::ProxyConfig;
use mcpmon::error::ProcessError;
use mcpmon::process::mock::MockProcessObserver;
use mcpmon::process::{ExitStatus, ProcessController, SpawnOptions, SpawnedProcess};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{oneshot, Mutex};

/// Build an [`ExitStatus`] for a given exit code, the way a clean exit
/// would report it.
pub fn exit_status(code: i32) -> ExitStatus {
    ExitStatus {
        code: Some(code),
        #[cfg(unix)]
        signal: None,
    }
}

/// A `ProcessController` that hands out pre-built [`SpawnedProcess`]es (or
/// errors) in the order the test queued them, one per `spawn()` call.
/// Spawning past the end of the queue surfaces as "command not found" so a
/// test that doesn't expect more spawns fails loudly instead of hanging.
pub struct ScriptedProcessController {
    queue: Mutex<VecDeque<Result<SpawnedProcess, ProcessError>>>,
    spawn_calls: AtomicUsize,
}

impl ScriptedProcessController {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            spawn_calls: AtomicUsize::new(0),
        }
    }

    pub async fn push(&self, process: SpawnedProcess) {
        self.queue.lock().await.push_back(Ok(process));
    }

    pub async fn push_err(&self, err: ProcessError) {
        self.queue.lock().await.push_back(Err(err));
    }

    pub fn spawn_calls(&self) -> usize {
        self.spawn_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessController for ScriptedProcessController {
    async fn spawn(
        &self,
        _command: &str,
        _args: &[String],
        _options: SpawnOptions,
    ) -> Result<SpawnedProcess, ProcessError> {
        self.spawn_calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.queue.lock().await;
        queue
            .pop_front()
            .unwrap_or_else(|| Err(ProcessError::CommandNotFound("<no more scripted processes>".into())))
    }
}

/// A `ProxyConfig` with short timings so debounce/grace/warmup don't make
/// the test suite slow, and a single explicit watch target so auto-detect
/// never has to run.
pub fn test_config(watch: &str, debounce_ms: u64) -> ProxyConfig {
    ProxyConfig::build(
        "test-server".to_string(),
        vec![],
        vec![PathBuf::from(watch)],
        Some(debounce_ms),
        None,
        None,
        HashMap::new(),
        Some(5),
        Some(5),
    )
    .expect("test config should resolve")
}

/// Read one line, bounded by a generous timeout so a harness bug hangs the
/// test instead of the whole suite.
pub async fn next_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Option<String> {
    let mut line = String::new();
    match tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line)).await {
        Ok(Ok(0)) => None,
        Ok(Ok(_)) => Some(line),
        Ok(Err(_)) => None,
        Err(_) => None,
    }
}

/// Poll a [`MockProcessObserver`] until the Supervisor has signalled it
/// (graceful or forced termination), then simulate the process actually
/// exiting by firing `exit_tx`. Mirrors how a real child only exits some
/// time after receiving SIGTERM.
pub async fn wait_for_termination_and_exit(
    observer: &MockProcessObserver,
    exit_tx: oneshot::Sender<ExitStatus>,
    code: i32,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !observer.was_terminated() {
        if tokio::time::Instant::now() > deadline {
            panic!("process was never signalled for termination");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let _ = exit_tx.send(exit_status(code));
}
