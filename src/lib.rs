//! mcpmon — a hot-reload supervisor for servers speaking the Model Context
//! Protocol (MCP) over stdio.
//!
//! This crate implements the proxy core:
//! a [`supervisor::Supervisor`] that owns a server subprocess (via
//! [`process::ProcessController`]), watches filesystem paths (via
//! [`watch::ChangeSource`]), forwards the JSON-RPC conversation between an
//! external client and the current server ([`forwarder`]), preserves
//! session state across restarts ([`session::SessionRecorder`]), and
//! buffers client traffic while no server is attached ([`buffer::MessageBuffer`]).
//!
//! `setup` is a separate, self-contained CLI utility that shares the binary
//! but never touches the proxy core.

pub mod buffer;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod process;
pub mod protocol;
pub mod session;
pub mod setup;
pub mod supervisor;
pub mod watch;
