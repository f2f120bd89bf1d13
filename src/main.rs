//! `mcpmon` binary entry point — thin CLI layer over the proxy core.
//!
//! This module's only job is to resolve a [`mcpmon::config::ProxyConfig`]
//! (or a `setup` invocation) from argv/env and hand it to the library.
//! Grounded on the daemon's `main.rs`: a `clap` derive `Args`/`Subcommand`
//! pair, one `init_logging` helper wired before any `tracing` call, and a
//! `#[tokio::main]` entry point that dispatches by subcommand.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mcpmon::config::ProxyConfig;
use mcpmon::forwarder::HookChain;
use mcpmon::process::TokioProcessController;
use mcpmon::setup::{self, SetupOptions, Target};
use mcpmon::supervisor::Supervisor;
use mcpmon::watch::NotifyChangeSource;

#[derive(Parser)]
#[command(
    name = "mcpmon",
    version,
    about = "Hot-reload supervisor for MCP stdio servers",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to watch for changes. Repeatable, or comma-separated.
    #[arg(long = "watch", value_delimiter = ',')]
    watch: Vec<PathBuf>,

    /// Debounce delay in milliseconds before a restart is triggered.
    #[arg(long = "delay")]
    delay: Option<u64>,

    /// The server command to run, followed by its own arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command_and_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a host's MCP server config so launching it goes through mcpmon.
    Setup {
        /// Path to the host's MCP server config file.
        #[arg(long)]
        config: PathBuf,
        /// Convert every stdio-style server entry.
        #[arg(long)]
        all: bool,
        /// Name of a single server entry to convert.
        server_name: Option<String>,
        /// Revert the config from its newest backup.
        #[arg(long)]
        restore: bool,
        /// Print all configured servers and exit.
        #[arg(long)]
        list: bool,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let exit_code = match cli.command {
        Some(Commands::Setup {
            config,
            all,
            server_name,
            restore,
            list,
        }) => run_setup(config, all, server_name, restore, list).await,
        None => run_proxy(cli.watch, cli.delay, cli.command_and_args).await,
    };

    std::process::exit(exit_code);
}

/// Initialize the `tracing` subscriber. All diagnostics go to stderr — the
/// protocol stream owns stdout exclusively. `MCPMON_VERBOSE` maps to a
/// `debug` filter; otherwise `info`.
fn init_logging() {
    let verbose = std::env::var("MCPMON_VERBOSE")
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run_setup(
    config: PathBuf,
    all: bool,
    server_name: Option<String>,
    restore: bool,
    list: bool,
) -> i32 {
    let target = if all {
        Some(Target::All)
    } else {
        server_name.map(Target::Named)
    };

    let opts = SetupOptions {
        config,
        target,
        restore,
        list,
    };

    let mcpmon_bin = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "mcpmon".to_string());

    match setup::run(opts, &mcpmon_bin).await {
        Ok(code) => code,
        Err(e) => {
            error!(err = %e, "setup failed");
            1
        }
    }
}

/// Run the proxy core: build a `ProxyConfig`, wire the production
/// collaborators, and drive the `Supervisor` to completion on mcpmon's own
/// stdio.
async fn run_proxy(cli_watch: Vec<PathBuf>, cli_delay: Option<u64>, mut command_and_args: Vec<String>) -> i32 {
    if command_and_args.is_empty() {
        let _ = Cli::command().print_help();
        println!();
        return 0;
    }

    let command = command_and_args.remove(0);
    let args = command_and_args;

    let env_watch = std::env::var("MCPMON_WATCH").ok();
    let env_delay_ms = std::env::var("MCPMON_DELAY").ok().and_then(|s| s.parse().ok());
    let env_grace_ms = std::env::var("MCPMON_GRACE_MS").ok().and_then(|s| s.parse().ok());
    let env_warmup_ms = std::env::var("MCPMON_WARMUP_MS").ok().and_then(|s| s.parse().ok());

    let config = match ProxyConfig::build(
        command,
        args,
        cli_watch,
        cli_delay,
        env_watch,
        env_delay_ms,
        HashMap::new(),
        env_grace_ms,
        env_warmup_ms,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(err = %e, "could not resolve proxy configuration");
            return 1;
        }
    };

    let change_source = match NotifyChangeSource::start(&config.watch_targets) {
        Ok(source) => Box::new(source),
        Err(e) => {
            error!(err = %e, "failed to establish file watch");
            return 1;
        }
    };

    info!(
        command = %config.command,
        watch = ?config.watch_targets,
        debounce_ms = config.debounce_delay.as_millis(),
        "mcpmon starting"
    );

    let process_controller: Arc<dyn mcpmon::process::ProcessController> = Arc::new(TokioProcessController);
    let hooks = HookChain::new(Duration::from_secs(2));

    let (supervisor, stop_handle) = Supervisor::new(config, process_controller, change_source, hooks);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        stop_handle.stop();
    });

    supervisor.run(tokio::io::stdout(), tokio::io::stdin()).await
}

/// Wait for Ctrl-C or, on unix, SIGTERM — whichever comes first. Either
/// one triggers a graceful stop of the Supervisor's run loop.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
