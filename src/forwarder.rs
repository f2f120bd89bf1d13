//! Forwarder — the primitives that move newline-delimited JSON-RPC
//! frames between stdio endpoints: line readers that feed the Supervisor's
//! single coordinating task, a line writer, and the optional interception
//! hook chain.
//!
//! The actual bidirectional routing decision (forward now, buffer, or
//! absorb) is made by the Supervisor, which is the sole owner of restart
//! state — this module supplies the reusable I/O pieces so that
//! ownership stays put. Grounded on `mcp/client.rs`'s use of
//! `tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader}` for line-at-a-
//! time stdio, and on the `mcp-sctl` supervisor reference's
//! `read_line`/`write_all` proxy loop for the pump shape.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

/// Channel capacity for line-reader tasks. A bounded channel gives the
/// back-pressure needed: if the Supervisor falls behind
/// draining a reader, `send` blocks, which stalls that reader's next
/// `read_line` — and transitively the OS pipe it's reading from.
pub const CHANNEL_CAPACITY: usize = 256;

/// One line read from a stdio stream, tagged with which stream produced it
/// so the Supervisor's select loop can tell readers apart without needing
/// a distinct channel per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    ClientStdin,
    ServerStdout,
    ServerStderr,
}

#[derive(Debug, Clone)]
pub struct LineEvent {
    pub source: LineSource,
    pub line: String,
}

/// Spawn a task that reads `reader` line by line and forwards each line
/// (newline included) to `tx`, tagged with `source`. The task exits
/// silently on EOF or a read error, dropping `tx` — the receiving side
/// observes this as the channel closing.
pub fn spawn_line_reader<R>(
    reader: R,
    source: LineSource,
    tx: mpsc::Sender<LineEvent>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    spawn_buffered_line_reader(BufReader::new(reader), source, tx)
}

/// Like [`spawn_line_reader`], but continues reading from an
/// already-constructed `BufReader` instead of wrapping a fresh one.
///
/// Used when a reader has already been consumed directly (e.g. by the
/// Session Recorder's `initialize` replay) and any bytes left in its
/// internal buffer must not be discarded when steady-state line reading
/// resumes.
pub fn spawn_buffered_line_reader<R>(
    mut buf: BufReader<R>,
    source: LineSource,
    tx: mpsc::Sender<LineEvent>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match buf.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx
                        .send(LineEvent {
                            source,
                            line: line.clone(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!(?source, err = %e, "line reader error, stopping");
                    break;
                }
            }
        }
    })
}

/// Write one line (expected to already end in `\n`) and flush.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// An interception hook: observes and may rewrite a frame before it
/// is forwarded. Returning `None` suppresses the frame entirely; returning
/// `Some(replacement)` substitutes it.
#[async_trait]
pub trait FrameHook: Send + Sync {
    async fn before_client_to_server(&self, line: &str) -> Option<String> {
        Some(line.to_string())
    }

    async fn after_server_to_client(&self, line: &str) -> Option<String> {
        Some(line.to_string())
    }
}

/// Ordered chain of hooks, invoked in registration order. Each hook call is
/// bounded by `timeout` so a hung hook cannot block the Forwarder
/// indefinitely.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn FrameHook>>,
    timeout: Duration,
}

impl HookChain {
    pub fn new(timeout: Duration) -> Self {
        Self {
            hooks: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, hook: Arc<dyn FrameHook>) {
        self.hooks.push(hook);
    }

    pub async fn run_client_to_server(&self, mut line: String) -> Option<String> {
        for hook in &self.hooks {
            line = match tokio::time::timeout(self.timeout, hook.before_client_to_server(&line)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("frame hook timed out, passing frame through unmodified");
                    line
                }
            };
        }
        Some(line)
    }

    pub async fn run_server_to_client(&self, mut line: String) -> Option<String> {
        for hook in &self.hooks {
            line = match tokio::time::timeout(self.timeout, hook.after_server_to_client(&line)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("frame hook timed out, passing frame through unmodified");
                    line
                }
            };
        }
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    struct UppercaseHook;

    #[async_trait]
    impl FrameHook for UppercaseHook {
        async fn before_client_to_server(&self, line: &str) -> Option<String> {
            Some(line.to_uppercase())
        }
    }

    struct SuppressHook;

    #[async_trait]
    impl FrameHook for SuppressHook {
        async fn after_server_to_client(&self, _line: &str) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn hook_rewrites_frame() {
        let mut chain = HookChain::new(Duration::from_secs(1));
        chain.register(Arc::new(UppercaseHook));
        let result = chain.run_client_to_server("hello\n".into()).await;
        assert_eq!(result, Some("HELLO\n".to_string()));
    }

    #[tokio::test]
    async fn hook_can_suppress_frame() {
        let mut chain = HookChain::new(Duration::from_secs(1));
        chain.register(Arc::new(SuppressHook));
        let result = chain.run_server_to_client("hello\n".into()).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn line_reader_tags_source_and_closes_on_eof() {
        let (mut writer, reader) = duplex(1024);
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_line_reader(reader, LineSource::ServerStdout, tx);

        writer.write_all(b"line one\n").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, LineSource::ServerStdout);
        assert_eq!(event.line, "line one\n");

        drop(writer);
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }
}
