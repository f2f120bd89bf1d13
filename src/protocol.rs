//! JSON-RPC 2.0 frame parsing and the internal request-id namespace.
//!
//! mcpmon treats each newline-terminated line on the wire as one frame.
//! A frame is forwarded byte-for-byte whether or not it parses as JSON —
//! parsing here is purely opportunistic, to classify the frame for the
//! Supervisor and Session Recorder.

use serde_json::Value;

/// The exact method string emitted after a successful restart.
pub const TOOLS_LIST_CHANGED_METHOD: &str = "notifications/tools/list_changed";

/// Internal ids are minted from this floor, far above any id a real MCP
/// client is expected to generate, so the two spaces never collide.
const INTERNAL_ID_FLOOR: u64 = 1_000_000_000;

/// A parsed JSON-RPC line, classified for Supervisor/Recorder purposes.
/// Unparseable lines never produce a `Frame` — callers fall back to
/// forwarding the raw bytes.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A request bearing an id (`id` is not an internal id yet — the
    /// classification of "client vs. internal" is the Supervisor's job,
    /// since only it knows which ids it minted).
    Request {
        id: Value,
        method: String,
        raw: Value,
    },
    /// A response (bears an id, no `method`).
    Response { id: Value, raw: Value },
    /// A notification (no id).
    Notification { method: String, raw: Value },
}

/// Parse one line as a JSON-RPC 2.0 frame. Returns `None` if the line is
/// not valid JSON or not a recognizable JSON-RPC shape — the caller must
/// still forward the raw bytes in that case.
pub fn parse_frame(line: &str) -> Option<Frame> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let method = value.get("method").and_then(|m| m.as_str());
    let id = value.get("id").cloned();

    match (id, method) {
        (Some(id), Some(method)) => Some(Frame::Request {
            id,
            method: method.to_string(),
            raw: value,
        }),
        (Some(id), None) => Some(Frame::Response { id, raw: value }),
        (None, Some(method)) => Some(Frame::Notification {
            method: method.to_string(),
            raw: value,
        }),
        (None, None) => None,
    }
}

/// Render a JSON-RPC notification with no `id` and no `params` — used for
/// `notifications/tools/list_changed`.
pub fn notification_line(method: &str) -> String {
    let mut line = serde_json::to_string(&serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
    }))
    .expect("static notification shape always serializes");
    line.push('\n');
    line
}

/// Build a JSON-RPC request line for a given id/method/params.
pub fn request_line(id: &Value, method: &str, params: Option<Value>) -> String {
    let mut line = serde_json::to_string(&serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params.unwrap_or(Value::Null),
    }))
    .expect("request shape always serializes");
    line.push('\n');
    line
}

/// Mints ids from the internal namespace, disjoint from client ids.
#[derive(Debug, Default)]
pub struct InternalIdSource {
    next: u64,
}

impl InternalIdSource {
    pub fn new() -> Self {
        Self {
            next: INTERNAL_ID_FLOOR,
        }
    }

    /// Mint the next internal id as a JSON `Value`.
    pub fn next_id(&mut self) -> Value {
        let id = self.next;
        self.next += 1;
        Value::from(id)
    }
}

/// True if `id` falls in the internal namespace. Used by the Supervisor to
/// decide whether a response should be absorbed rather than forwarded to
/// the client.
pub fn is_internal_id(id: &Value) -> bool {
    id.as_u64().map(|n| n >= INTERNAL_ID_FLOOR).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request() {
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        match parse_frame(line) {
            Some(Frame::Request { id, method, .. }) => {
                assert_eq!(id, Value::from(1));
                assert_eq!(method, "tools/list");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn parses_response() {
        let line = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        assert!(matches!(parse_frame(line), Some(Frame::Response { .. })));
    }

    #[test]
    fn parses_notification() {
        let line = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert!(matches!(parse_frame(line), Some(Frame::Notification { .. })));
    }

    #[test]
    fn invalid_json_returns_none() {
        assert!(parse_frame("not-json-here").is_none());
    }

    #[test]
    fn blank_line_returns_none() {
        assert!(parse_frame("\n").is_none());
        assert!(parse_frame("").is_none());
    }

    #[test]
    fn internal_ids_are_disjoint_from_small_client_ids() {
        let mut source = InternalIdSource::new();
        let a = source.next_id();
        let b = source.next_id();
        assert!(is_internal_id(&a));
        assert!(is_internal_id(&b));
        assert_ne!(a, b);
        assert!(!is_internal_id(&Value::from(1)));
        assert!(!is_internal_id(&Value::from(42)));
    }

    #[test]
    fn notification_line_has_exact_method_string() {
        let line = notification_line(TOOLS_LIST_CHANGED_METHOD);
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["method"], "notifications/tools/list_changed");
        assert!(value.get("id").is_none());
    }
}
