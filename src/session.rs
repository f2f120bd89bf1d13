//! Session Recorder — remembers the client's `initialize` params and
//! the negotiated server capabilities, and replays `initialize` against a
//! freshly spawned server so it reaches the same protocol state as its
//! predecessor.
//!
//! Grounded on `mcp/client.rs`'s `initialize()` method (which sends the
//! MCP handshake and the `initialized` notification over a child's piped
//! stdio) and on the `mcp-sctl` supervisor reference
//! (`SupervisorState::init_request`/`init_notification`, which stores the
//! client's literal lines for replay after a worker reload).

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::protocol::{self, InternalIdSource};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("initialize replay timed out after {0:?}")]
    ReplayTimeout(Duration),
    #[error("write to server during replay failed: {0}")]
    WriteFailed(std::io::Error),
    #[error("read from server during replay failed: {0}")]
    ReadFailed(std::io::Error),
    #[error("server closed stdout during replay")]
    ServerClosed,
    #[error("malformed response during replay: {0}")]
    MalformedResponse(String),
}

/// Session state: captured initialize params, negotiated capabilities, and
/// the last observed tool list.
#[derive(Debug, Default)]
pub struct SessionRecorder {
    initialize_params: Option<Value>,
    capabilities: Option<Value>,
    last_tool_list: Option<Value>,
    session_id: uuid::Uuid,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4(),
            ..Default::default()
        }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Record the client's first `initialize` request verbatim. Set
    /// exactly once per Supervisor lifetime; later calls are no-ops.
    pub fn record_client_initialize(&mut self, params: Value) {
        if self.initialize_params.is_none() {
            self.initialize_params = Some(params);
        }
    }

    pub fn has_initialize_params(&self) -> bool {
        self.initialize_params.is_some()
    }

    /// Record the server's negotiated capabilities from an `initialize`
    /// response. Updated on every (re)initialization.
    pub fn record_capabilities(&mut self, capabilities: Value) {
        self.capabilities = Some(capabilities);
    }

    pub fn capabilities(&self) -> Option<&Value> {
        self.capabilities.as_ref()
    }

    pub fn record_tool_list(&mut self, tools: Value) {
        self.last_tool_list = Some(tools);
    }

    /// Replay the recorded `initialize` against a freshly spawned server,
    /// then probe `tools/list`. Both responses are consumed here and never
    /// exposed to the Forwarder — the caller is expected to own exclusive
    /// read access to `stdout` for the duration of this call, before
    /// forwarding resumes.
    ///
    /// Returns `Ok(())` once both the initialize and tools/list exchanges
    /// have either completed or been abandoned after their own internal
    /// failures — a replay failure does not prevent the transition to
    /// `Ready`; it is up to the caller to decide whether to count it
    /// against the startup retry budget.
    pub async fn replay_initialize<W, R>(
        &mut self,
        id_source: &mut InternalIdSource,
        writer: &mut W,
        reader: &mut BufReader<R>,
        timeout: Duration,
    ) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
        R: tokio::io::AsyncRead + Unpin,
    {
        let params = self.initialize_params.clone().unwrap_or(Value::Null);
        let id = id_source.next_id();
        let line = protocol::request_line(&id, "initialize", Some(params));

        write_line(writer, &line).await?;

        let response = read_matching_response(reader, &id, timeout).await?;
        if let Some(error) = response.get("error") {
            warn!(error = %error, "initialize replay returned an error, continuing anyway");
        } else if let Some(result) = response.get("result") {
            if let Some(caps) = result.get("capabilities") {
                self.record_capabilities(caps.clone());
            }
            debug!(
                protocol = result.get("protocolVersion").and_then(|v| v.as_str()).unwrap_or("?"),
                "initialize replay complete"
            );
        }

        // `notifications/initialized` — no response expected.
        let notif = serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let mut notif_line = serde_json::to_string(&notif).expect("static shape");
        notif_line.push('\n');
        write_line(writer, &notif_line).await?;

        self.probe_tools_list(id_source, writer, reader, timeout)
            .await
    }

    /// Issue an internal `tools/list` probe and absorb its response,
    /// regardless of outcome.
    async fn probe_tools_list<W, R>(
        &mut self,
        id_source: &mut InternalIdSource,
        writer: &mut W,
        reader: &mut BufReader<R>,
        timeout: Duration,
    ) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
        R: tokio::io::AsyncRead + Unpin,
    {
        let id = id_source.next_id();
        let line = protocol::request_line(&id, "tools/list", None);
        write_line(writer, &line).await?;

        match read_matching_response(reader, &id, timeout).await {
            Ok(response) => {
                if let Some(tools) = response.get("result").and_then(|r| r.get("tools")) {
                    self.record_tool_list(tools.clone());
                }
                Ok(())
            }
            Err(e) => {
                // The probe is best-effort: regardless of its outcome the
                // Supervisor still emits tools/list_changed.
                warn!(err = %e, "tools/list probe during replay failed, continuing");
                Ok(())
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), SessionError> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(SessionError::WriteFailed)?;
    writer.flush().await.map_err(SessionError::WriteFailed)
}

/// Read lines from `reader` until one parses as a response bearing `id`,
/// or until `timeout` elapses. Any other line encountered along the way
/// (a stray notification, for instance) is logged and skipped — it is not
/// this function's job to forward it anywhere.
async fn read_matching_response<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    id: &Value,
    timeout: Duration,
) -> Result<Value, SessionError> {
    tokio::time::timeout(timeout, async {
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(SessionError::ReadFailed)?;
            if n == 0 {
                return Err(SessionError::ServerClosed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(trimmed)
                .map_err(|e| SessionError::MalformedResponse(e.to_string()))?;
            if value.get("id") == Some(id) {
                return Ok(value);
            }
            debug!(line = %trimmed, "ignoring unrelated line during replay");
        }
    })
    .await
    .map_err(|_| SessionError::ReplayTimeout(timeout))?
}
