//! Process Controller — abstracts spawning a child with piped stdio
//! and sending termination signals, graceful-then-forced.
//!
//! Grounded on `mcp/client.rs`, which spawns an MCP server subprocess
//! with `tokio::process::Command` and piped stdin/stdout; this module
//! generalizes that one-shot spawn into a reusable controller with an
//! explicit kill/escalation path.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};

use crate::error::ProcessError;

/// Exit status of a finished child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    #[cfg(unix)]
    pub signal: Option<i32>,
}

/// Options for spawning a child.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// A spawned child process's stdio endpoints plus its lifecycle handle.
/// Boxed trait objects for stdin/stdout/stderr so the mock implementation
/// (used by the Supervisor's tests) can hand back in-memory pipes instead
/// of real OS pipes.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    inner: ProcessHandle,
}

enum ProcessHandle {
    Real(tokio::process::Child),
    #[cfg(any(test, feature = "test-support"))]
    Mock(crate::process::mock::MockHandle),
}

impl SpawnedProcess {
    fn real(mut child: tokio::process::Child) -> Result<Self, ProcessError> {
        let pid = child.id();
        let stdin: ChildStdin = child.stdin.take().expect("stdin piped at spawn");
        let stdout: ChildStdout = child.stdout.take().expect("stdout piped at spawn");
        let stderr: ChildStderr = child.stderr.take().expect("stderr piped at spawn");
        Ok(Self {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            inner: ProcessHandle::Real(child),
        })
    }

    /// Wait for the process to exit, yielding its exit status.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        match &mut self.inner {
            ProcessHandle::Real(child) => {
                let status = child
                    .wait()
                    .await
                    .map_err(|e| ProcessError::SpawnFailed {
                        command: "<running child>".into(),
                        source: e,
                    })?;
                Ok(ExitStatus {
                    code: status.code(),
                    #[cfg(unix)]
                    signal: {
                        use std::os::unix::process::ExitStatusExt;
                        status.signal()
                    },
                })
            }
            #[cfg(any(test, feature = "test-support"))]
            ProcessHandle::Mock(handle) => handle.wait().await,
        }
    }

    /// Send a graceful termination signal (SIGTERM on unix, best-effort
    /// `kill()` elsewhere).
    pub fn terminate_gracefully(&mut self) -> Result<(), ProcessError> {
        match &mut self.inner {
            ProcessHandle::Real(child) => {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                        if rc != 0 {
                            return Err(ProcessError::SignalFailed {
                                pid,
                                source: std::io::Error::last_os_error(),
                            });
                        }
                    }
                    Ok(())
                }
                #[cfg(not(unix))]
                {
                    child.start_kill().map_err(|e| ProcessError::SignalFailed {
                        pid: child.id().unwrap_or(0),
                        source: e,
                    })
                }
            }
            #[cfg(any(test, feature = "test-support"))]
            ProcessHandle::Mock(handle) => handle.terminate_gracefully(),
        }
    }

    /// Force-kill the process (SIGKILL / platform equivalent).
    pub fn kill_forcefully(&mut self) -> Result<(), ProcessError> {
        match &mut self.inner {
            ProcessHandle::Real(child) => child
                .start_kill()
                .map_err(|e| ProcessError::SignalFailed {
                    pid: child.id().unwrap_or(0),
                    source: e,
                }),
            #[cfg(any(test, feature = "test-support"))]
            ProcessHandle::Mock(handle) => handle.kill_forcefully(),
        }
    }
}

/// Abstracts "spawn and manage a child process" so the Supervisor can be
/// driven against a mock in tests.
#[async_trait]
pub trait ProcessController: Send + Sync {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<SpawnedProcess, ProcessError>;
}

/// Production implementation backed by `tokio::process::Command`.
pub struct TokioProcessController;

#[async_trait]
impl ProcessController for TokioProcessController {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<SpawnedProcess, ProcessError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args);
        for (k, v) in &options.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(command.to_string())
            } else {
                ProcessError::SpawnFailed {
                    command: command.to_string(),
                    source: e,
                }
            }
        })?;

        SpawnedProcess::real(child)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio::sync::{oneshot, Mutex};

    /// An in-memory stand-in for a child process: stdio is a duplex pipe
    /// the test drives directly, and exit is triggered explicitly via
    /// `exit_tx` rather than waiting on a real OS process.
    pub struct MockHandle {
        exit_rx: Arc<Mutex<Option<oneshot::Receiver<ExitStatus>>>>,
        terminated: Arc<std::sync::atomic::AtomicBool>,
    }

    impl MockHandle {
        pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
            let rx = self.exit_rx.lock().await.take();
            match rx {
                Some(rx) => Ok(rx.await.unwrap_or(ExitStatus {
                    code: Some(0),
                    #[cfg(unix)]
                    signal: None,
                })),
                None => std::future::pending().await,
            }
        }

        pub fn terminate_gracefully(&mut self) -> Result<(), ProcessError> {
            self.terminated
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        pub fn kill_forcefully(&mut self) -> Result<(), ProcessError> {
            self.terminated
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        /// Whether a termination signal (graceful or forced) has been sent.
        /// Exposed so tests can assert the Supervisor actually tried to stop
        /// the outgoing server before spawning its replacement.
        pub fn was_terminated(&self) -> bool {
            self.terminated.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    /// A cheap, cloneable observer into a [`MockHandle`] that outlives the
    /// opaque `SpawnedProcess` it came from, so a test can assert whether
    /// the Supervisor ever signalled the mock process after moving the
    /// `SpawnedProcess` itself into a `ProcessController`.
    #[derive(Clone)]
    pub struct MockProcessObserver(Arc<std::sync::atomic::AtomicBool>);

    impl MockProcessObserver {
        pub fn was_terminated(&self) -> bool {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    /// Build a `SpawnedProcess` backed by in-memory duplex pipes, plus the
    /// writer/reader handles the test harness uses to play the server's
    /// side of the conversation, an `exit` sender the test calls to
    /// simulate a crash or clean exit, and an observer for termination.
    pub fn mock_process() -> (
        SpawnedProcess,
        tokio::io::DuplexStream, // write here to feed "stdout" to mcpmon
        tokio::io::DuplexStream, // read here to observe what mcpmon wrote to "stdin"
        oneshot::Sender<ExitStatus>,
        MockProcessObserver,
    ) {
        let (stdin_server_side, stdin_client_side) = duplex(64 * 1024);
        let (stdout_server_side, stdout_client_side) = duplex(64 * 1024);
        let (_, stderr_client_side) = duplex(1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let terminated = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handle = MockHandle {
            exit_rx: Arc::new(Mutex::new(Some(exit_rx))),
            terminated: terminated.clone(),
        };

        let process = SpawnedProcess {
            pid: Some(0),
            stdin: Box::new(stdin_client_side),
            stdout: Box::new(stdout_client_side),
            stderr: Box::new(stderr_client_side),
            inner: ProcessHandle::Mock(handle),
        };

        (
            process,
            stdout_server_side,
            stdin_server_side,
            exit_tx,
            MockProcessObserver(terminated),
        )
    }
}
