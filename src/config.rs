//! Proxy configuration.
//!
//! CLI parsing itself lives in `main.rs`, which owns translating `clap`'s
//! `Args` into a `ProxyConfig`; this module only assembles the immutable
//! `ProxyConfig` the Supervisor runs with, and owns the defaults and the
//! override order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// File extensions eligible for watch-target auto-detection.
pub const AUTO_DETECT_EXTENSIONS: &[&str] = &["js", "mjs", "ts", "py", "rb", "php"];

const DEFAULT_DEBOUNCE_MS: u64 = 100;
const DEFAULT_GRACE_MS: u64 = 500;
const DEFAULT_WARMUP_MS: u64 = 75;
const DEFAULT_STARTUP_RETRIES: u32 = 3;
const DEFAULT_INTERNAL_TIMEOUT_SECS: u64 = 5;

/// Immutable once the Supervisor starts.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// The server command to spawn.
    pub command: String,
    /// Arguments passed to `command`.
    pub args: Vec<String>,
    /// Paths to watch for changes. Non-empty unless `watch_disabled`.
    pub watch_targets: Vec<PathBuf>,
    /// If true, no Change Source is started at all (no CLI flag surfaces
    /// this today, but it keeps the "non-empty OR explicit disable"
    /// invariant satisfiable without a sentinel empty vec).
    pub watch_disabled: bool,
    /// Trailing-edge debounce delay before a restart is triggered.
    pub debounce_delay: Duration,
    /// Grace period before escalating graceful termination to a forced kill.
    pub grace_period: Duration,
    /// Post-spawn warmup before the server is considered reachable.
    pub warmup: Duration,
    /// Timeout for internally synthesized requests (initialize replay,
    /// tools/list probe).
    pub internal_request_timeout: Duration,
    /// Consecutive startup failures tolerated before entering `Failed`.
    pub startup_retry_budget: u32,
    /// Extra environment variables injected into the child process.
    pub env: HashMap<String, String>,
    /// Optional data directory, passed through to optional collaborators
    /// (extensions) — unused by the core itself.
    pub data_dir: Option<PathBuf>,
    /// Soft warning watermark for the Message Buffer.
    pub buffer_warn_watermark: usize,
}

impl ProxyConfig {
    /// Build a config from explicit CLI values, falling back to
    /// environment variables, falling back to built-in defaults, the way
    /// `DaemonConfig` merges `--flag` over `CLAWD_*` env vars over
    /// defaults, generalized here to every tunable rather than just the
    /// watch target.
    ///
    /// `env_grace_ms`/`env_warmup_ms` are the `MCPMON_GRACE_MS`/
    /// `MCPMON_WARMUP_MS` escape hatches; no CLI flag exposes these today.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        command: String,
        args: Vec<String>,
        cli_watch: Vec<PathBuf>,
        cli_delay_ms: Option<u64>,
        env_watch: Option<String>,
        env_delay_ms: Option<u64>,
        env: HashMap<String, String>,
        env_grace_ms: Option<u64>,
        env_warmup_ms: Option<u64>,
    ) -> Result<Self, crate::error::SupervisorError> {
        let watch_targets = if !cli_watch.is_empty() {
            cli_watch
        } else if let Some(csv) = env_watch.filter(|s| !s.trim().is_empty()) {
            csv.split(',').map(|s| PathBuf::from(s.trim())).collect()
        } else if let Some(detected) = auto_detect_watch_target(&args) {
            vec![detected]
        } else {
            return Err(crate::error::SupervisorError::NoWatchTarget);
        };

        let debounce_ms = cli_delay_ms.or(env_delay_ms).unwrap_or(DEFAULT_DEBOUNCE_MS);
        let grace_ms = env_grace_ms.unwrap_or(DEFAULT_GRACE_MS);
        let warmup_ms = env_warmup_ms.unwrap_or(DEFAULT_WARMUP_MS);

        Ok(Self {
            command,
            args,
            watch_targets,
            watch_disabled: false,
            debounce_delay: Duration::from_millis(debounce_ms),
            grace_period: Duration::from_millis(grace_ms),
            warmup: Duration::from_millis(warmup_ms),
            internal_request_timeout: Duration::from_secs(DEFAULT_INTERNAL_TIMEOUT_SECS),
            startup_retry_budget: DEFAULT_STARTUP_RETRIES,
            env,
            data_dir: None,
            buffer_warn_watermark: 1000,
        })
    }
}

/// Auto-detect a watch target: the first argument after the command whose
/// extension matches `AUTO_DETECT_EXTENSIONS`.
pub fn auto_detect_watch_target(args: &[String]) -> Option<PathBuf> {
    args.iter().find_map(|arg| {
        let path = PathBuf::from(arg);
        let ext = path.extension()?.to_str()?;
        AUTO_DETECT_EXTENSIONS
            .contains(&ext)
            .then(|| path)
    })
}
