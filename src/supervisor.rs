//! Supervisor — the top-level state machine. Sequences
//! `spawn → run → (change detected) → kill → spawn`, debounces watch
//! events, and is the sole serializer of all mutable proxy state.
//!
//! Grounded algorithmically on the `mcp-sctl` supervisor reference
//! (generation counter, stored `initialize` request, pending-request
//! tracking, `tokio::select!`-driven proxy loop) and on the
//! channel-centric background-task style of `telemetry/mod.rs`'s
//! `tokio::select!` flush loop. The Process Controller, Change Source,
//! Forwarder, Session Recorder, and Message Buffer collaborators are the
//! ones defined in this crate's `process`, `watch`, `forwarder`,
//! `session`, and `buffer` modules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::MessageBuffer;
use crate::config::ProxyConfig;
use crate::error::{ProcessError, SupervisorError};
use crate::forwarder::{self, FrameHook, HookChain, LineEvent, LineSource};
use crate::process::{ExitStatus, ProcessController, SpawnOptions, SpawnedProcess};
use crate::protocol::{self, Frame, InternalIdSource};
use crate::session::SessionRecorder;
use crate::watch::ChangeSource;

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Starting,
    Ready,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

/// Why the current generation's inner loop ended.
enum LoopExit {
    /// The server exited on its own (crash or clean exit).
    ServerExited(ExitStatus),
    /// A debounced restart was triggered by the Change Source.
    ChangeTriggered,
    /// `stop()` was requested or client stdin hit EOF.
    StopRequested,
}

/// Tracks one client-originated request forwarded to the current server,
/// so that if the server is killed mid-flight the raw line can be
/// re-queued for the next server.
struct PendingEntry {
    #[allow(dead_code)]
    method: String,
    raw_line: String,
}

/// Where output for the client lives: real process stdout, piped through
/// unconditionally so tests can swap in an in-memory sink.
pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type ClientReader = Box<dyn AsyncRead + Send + Unpin>;

pub struct Supervisor {
    config: ProxyConfig,
    process_controller: Arc<dyn ProcessController>,
    change_source: Box<dyn ChangeSource>,
    hooks: HookChain,
    session: SessionRecorder,
    buffer: MessageBuffer,
    id_source: InternalIdSource,
    pending: HashMap<String, PendingEntry>,
    /// Id of the client's first `initialize` request, while the Supervisor
    /// is waiting for the server to answer it during the very first boot.
    /// `None` once Ready, always `None` on restarts (those synthesize
    /// their own initialize instead).
    ready_pending_id: Option<Value>,
    state: State,
    spawn_count: u64,
    exit_count: u64,
    /// Consecutive spawn/initialize failures since the last generation
    /// reached `Ready`. Reset on every successful `Ready` transition so the
    /// retry budget only ever trips on a consecutive run of failures, not
    /// an accumulation over the proxy's whole lifetime.
    startup_failures: u32,
    stop_rx: mpsc::Receiver<()>,
}

/// Handle used to request a graceful stop from outside the run loop (a
/// signal handler task, or a test).
#[derive(Clone)]
pub struct StopHandle(mpsc::Sender<()>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.try_send(());
    }
}

impl Supervisor {
    pub fn new(
        config: ProxyConfig,
        process_controller: Arc<dyn ProcessController>,
        change_source: Box<dyn ChangeSource>,
        hooks: HookChain,
    ) -> (Self, StopHandle) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let buffer_watermark = config.buffer_warn_watermark;
        let supervisor = Self {
            config,
            process_controller,
            change_source,
            hooks,
            session: SessionRecorder::new(),
            buffer: MessageBuffer::new(buffer_watermark),
            id_source: InternalIdSource::new(),
            pending: HashMap::new(),
            ready_pending_id: None,
            state: State::Idle,
            spawn_count: 0,
            exit_count: 0,
            startup_failures: 0,
            stop_rx,
        };
        (supervisor, StopHandle(stop_tx))
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Starting | State::Ready | State::Restarting)
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawn_count
    }

    /// Run the Supervisor to completion: initial spawn, steady-state
    /// forwarding, restart cycles, and graceful shutdown. Returns once the
    /// process should exit, with its exit code.
    pub async fn run<CW, CR>(mut self, client_writer: CW, client_reader: CR) -> i32
    where
        CW: AsyncWrite + Send + Unpin + 'static,
        CR: AsyncRead + Send + Unpin + 'static,
    {
        self.state = State::Starting;

        let (client_tx, mut client_rx) = mpsc::channel(forwarder::CHANNEL_CAPACITY);
        forwarder::spawn_line_reader(client_reader, LineSource::ClientStdin, client_tx);
        let mut client_writer = client_writer;

        let mut server = match self.spawn_with_retries().await {
            Ok(server) => server,
            Err(e) => {
                error!(err = %e, "startup failed, exhausted retry budget");
                self.state = State::Failed;
                return 1;
            }
        };

        loop {
            let is_restart = self.spawn_count > 1;
            let exit = self
                .run_generation(&mut server, &mut client_rx, &mut client_writer, is_restart)
                .await;

            match exit {
                Ok(LoopExit::StopRequested) => {
                    self.state = State::Stopping;
                    self.shutdown(&mut server).await;
                    self.state = State::Stopped;
                    return 0;
                }
                Ok(LoopExit::ServerExited(status)) => {
                    self.exit_count += 1;
                    info!(?status, "server exited during steady state, respawning immediately");
                    self.state = State::Restarting;
                    self.requeue_pending_as_buffer();
                    // Crash after Ready: single immediate restart, not
                    // debounced, and it does not consume the startup
                    // retry budget.
                    match self.process_controller.spawn(
                        &self.config.command,
                        &self.config.args,
                        SpawnOptions {
                            env: self.config.env.clone(),
                            cwd: None,
                        },
                    )
                    .await
                    {
                        Ok(new_server) => {
                            self.spawn_count += 1;
                            server = new_server;
                            self.state = State::Starting;
                        }
                        Err(e) => {
                            error!(err = %e, "respawn after crash failed");
                            self.state = State::Failed;
                            return 1;
                        }
                    }
                }
                Ok(LoopExit::ChangeTriggered) => {
                    self.state = State::Restarting;
                    self.requeue_pending_as_buffer();
                    self.terminate_and_wait(&mut server).await;
                    self.exit_count += 1;
                    server = match self.spawn_with_retries().await {
                        Ok(server) => server,
                        Err(e) => {
                            error!(err = %e, "restart failed, exhausted retry budget");
                            self.state = State::Failed;
                            return 1;
                        }
                    };
                    self.state = State::Starting;
                }
                Err(e) => {
                    error!(err = %e, "fatal error in generation loop");
                    self.state = State::Failed;
                    return 1;
                }
            }
        }
    }

    /// Spawn with retry-and-backoff until the startup retry budget is
    /// exhausted.
    async fn spawn_with_retries(&mut self) -> Result<SpawnedProcess, SupervisorError> {
        loop {
            match self
                .process_controller
                .spawn(
                    &self.config.command,
                    &self.config.args,
                    SpawnOptions {
                        env: self.config.env.clone(),
                        cwd: None,
                    },
                )
                .await
            {
                Ok(server) => {
                    self.spawn_count += 1;
                    return Ok(server);
                }
                Err(ProcessError::CommandNotFound(cmd)) => {
                    error!(command = %cmd, "command not found");
                    return Err(SupervisorError::Process(ProcessError::CommandNotFound(cmd)));
                }
                Err(e) => {
                    self.startup_failures += 1;
                    warn!(err = %e, attempt = self.startup_failures, "spawn failed");
                    if self.startup_failures >= self.config.startup_retry_budget {
                        return Err(SupervisorError::RetriesExhausted(self.startup_failures));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Run one server generation: bring it to Ready, then pump frames
    /// until a restart/crash/stop condition ends the generation.
    ///
    /// Stdout is read through a single `BufReader` for the whole
    /// generation: on a restart it is handed directly to
    /// [`SessionRecorder::replay_initialize`], and whatever bytes are left
    /// in its internal buffer afterwards carry over into the steady-state
    /// line reader instead of being silently dropped.
    async fn run_generation<CW>(
        &mut self,
        server: &mut SpawnedProcess,
        client_rx: &mut mpsc::Receiver<LineEvent>,
        client_writer: &mut CW,
        is_restart: bool,
    ) -> Result<LoopExit, SupervisorError>
    where
        CW: AsyncWrite + Unpin,
    {
        let (server_tx, mut server_rx) = mpsc::channel(forwarder::CHANNEL_CAPACITY);

        let stdout = std::mem::replace(&mut server.stdout, Box::new(tokio::io::empty()));
        let mut stdout_reader = BufReader::new(stdout);
        forwarder::spawn_line_reader(
            std::mem::replace(&mut server.stderr, Box::new(tokio::io::empty())),
            LineSource::ServerStderr,
            server_tx.clone(),
        );

        tokio::time::sleep(self.config.warmup).await;

        if is_restart {
            let timeout = self.config.internal_request_timeout;
            if let Err(e) = self
                .session
                .replay_initialize(&mut self.id_source, &mut server.stdin, &mut stdout_reader, timeout)
                .await
            {
                warn!(err = %e, "initialize replay failed, transitioning to Ready anyway");
            }

            let buffered = self.buffer.drain_all();
            for frame in buffered {
                if let Err(e) = forwarder::write_line(&mut server.stdin, &frame.line).await {
                    warn!(err = %e, "failed to replay buffered frame after restart");
                    break;
                }
            }

            let notification = protocol::notification_line(protocol::TOOLS_LIST_CHANGED_METHOD);
            if let Err(e) = forwarder::write_line(client_writer, &notification).await {
                warn!(err = %e, "failed to send tools/list_changed to client");
            }

            self.state = State::Ready;
            self.startup_failures = 0;
        }

        forwarder::spawn_buffered_line_reader(stdout_reader, LineSource::ServerStdout, server_tx);

        let mut restart_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = sleep_until_opt(restart_deadline), if restart_deadline.is_some() => {
                    return Ok(LoopExit::ChangeTriggered);
                }

                _ = self.stop_rx.recv() => {
                    return Ok(LoopExit::StopRequested);
                }

                exit = server.wait() => {
                    let status = exit.unwrap_or(ExitStatus { code: None, #[cfg(unix)] signal: None });
                    return Ok(LoopExit::ServerExited(status));
                }

                event = self.change_source.recv() => {
                    if let Some(event) = event {
                        debug!(?event, "change event observed");
                        restart_deadline = Some(Instant::now() + self.config.debounce_delay);
                    }
                }

                event = client_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.handle_client_line(event.line, server, client_writer).await;
                        }
                        // EOF on client stdin: treated as a graceful stop (spec.md
                        // §7, "Client disconnect"), not a busy-poll on a closed
                        // channel.
                        None => {
                            return Ok(LoopExit::StopRequested);
                        }
                    }
                }

                Some(event) = server_rx.recv() => {
                    match event.source {
                        LineSource::ServerStdout => {
                            self.handle_server_line(event.line, server, client_writer).await;
                        }
                        LineSource::ServerStderr => {
                            // Structured interpretation of stderr is left
                            // to external tooling; mcpmon only passes it
                            // through to its own stderr.
                            eprint!("{}", event.line);
                        }
                        LineSource::ClientStdin => unreachable!("server_rx only carries server-tagged events"),
                    }
                }
            }
        }
    }

    /// Handle one raw line read from the client. During `Starting` (first
    /// boot only), the client's own `initialize` is forwarded immediately
    /// rather than buffered, since its response is what flips the
    /// Supervisor to `Ready`.
    async fn handle_client_line<CW: AsyncWrite + Unpin>(
        &mut self,
        line: String,
        server: &mut SpawnedProcess,
        _client_writer: &mut CW,
    ) {
        let parsed = protocol::parse_frame(&line);

        let is_first_initialize = matches!(&parsed, Some(Frame::Request { method, .. }) if method == "initialize")
            && !self.session.has_initialize_params();

        if is_first_initialize {
            if let Ok(value) = serde_json::from_str::<Value>(line.trim()) {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                self.session.record_client_initialize(params);
            }
        }

        let rewritten = self.hooks.run_client_to_server(line).await;
        let Some(line) = rewritten else {
            return;
        };

        let forward_now = self.state == State::Ready || is_first_initialize;

        if forward_now {
            if let Some(Frame::Request { id, method, .. }) = &parsed {
                if is_first_initialize {
                    self.ready_pending_id = Some(id.clone());
                }
                self.pending.insert(
                    id.to_string(),
                    PendingEntry {
                        method: method.clone(),
                        raw_line: line.clone(),
                    },
                );
            }
            if let Err(e) = forwarder::write_line(&mut server.stdin, &line).await {
                warn!(err = %e, "write to server stdin failed, re-queuing frame");
                self.buffer.enqueue(line);
            }
        } else {
            self.buffer.enqueue(line);
        }
    }

    /// Handle one raw line read from the current server's stdout.
    /// Internal-id responses are absorbed; everything else is tapped and forwarded verbatim.
    ///
    /// On first boot, the response matching `ready_pending_id` is the
    /// server's answer to the client's own `initialize` — forwarding it is
    /// what flips the Supervisor to `Ready`, after which any frames the
    /// client sent while still `Starting` are drained from the Message
    /// Buffer straight to the server.
    async fn handle_server_line<CW: AsyncWrite + Unpin>(
        &mut self,
        line: String,
        server: &mut SpawnedProcess,
        client_writer: &mut CW,
    ) {
        let parsed = protocol::parse_frame(&line);

        if let Some(Frame::Response { id, .. }) = &parsed {
            if protocol::is_internal_id(id) {
                debug!("absorbed response for internally-synthesized request");
                return;
            }
            self.pending.remove(&id.to_string());

            if self.state == State::Starting && self.ready_pending_id.as_ref() == Some(id) {
                self.ready_pending_id = None;
                self.state = State::Ready;
                self.startup_failures = 0;

                if let Some(line) = self.hooks.run_server_to_client(line).await {
                    if let Err(e) = forwarder::write_line(client_writer, &line).await {
                        warn!(err = %e, "write to client stdout failed");
                    }
                }

                let buffered = self.buffer.drain_all();
                for frame in buffered {
                    if let Err(e) = forwarder::write_line(&mut server.stdin, &frame.line).await {
                        warn!(err = %e, "failed to flush buffered frame after first-boot ready transition");
                        break;
                    }
                }
                return;
            }
        }

        let Some(line) = self.hooks.run_server_to_client(line).await else {
            return;
        };

        if let Err(e) = forwarder::write_line(client_writer, &line).await {
            warn!(err = %e, "write to client stdout failed");
        }
    }

    /// Before respawning, any client requests still awaiting a response
    /// from the outgoing server are re-queued into the Message Buffer so
    /// they are replayed against the next server/(b)).
    fn requeue_pending_as_buffer(&mut self) {
        for (_, entry) in self.pending.drain() {
            self.buffer.enqueue(entry.raw_line);
        }
    }

    async fn terminate_and_wait(&mut self, server: &mut SpawnedProcess) {
        if let Err(e) = server.terminate_gracefully() {
            warn!(err = %e, "graceful termination failed, escalating to forced kill");
            let _ = server.kill_forcefully();
        }

        match tokio::time::timeout(self.config.grace_period, server.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("graceful termination grace period elapsed, forcing kill");
                let _ = server.kill_forcefully();
                if tokio::time::timeout(self.config.grace_period, server.wait())
                    .await
                    .is_err()
                {
                    warn!("forced kill also failed to produce exit within grace period, proceeding anyway");
                }
            }
        }
    }

    async fn shutdown(&mut self, server: &mut SpawnedProcess) {
        self.terminate_and_wait(server).await;
        self.buffer.drain_all();
    }

    pub fn register_hook(&mut self, hook: Arc<dyn FrameHook>) {
        self.hooks.register(hook);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
