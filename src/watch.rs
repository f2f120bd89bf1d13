//! Change Source — abstracts "something to watch", yielding a
//! stream of change events for a set of targets.
//!
//! Grounded on `repo/watcher.rs`, which wraps `notify_debouncer_full`
//! around a callback; this module generalizes that callback-based watcher
//! into an async stream the Supervisor can `.recv()` from, and adds the
//! create/modify/remove classification and tolerance for transient
//! "not found" errors a save-via-rename editor can trigger.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use notify_debouncer_full::notify::{EventKind, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::WatchError;

/// Kind of filesystem change observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
}

/// A single change event. Delivery is at-least-once; duplicates within a
/// debounce window are the Supervisor's problem to collapse, not this
/// module's.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Abstracts a source of change events so the Supervisor can be driven
/// against a mock in tests.
#[async_trait]
pub trait ChangeSource: Send {
    /// Receive the next change event, or `None` once the source is closed.
    async fn recv(&mut self) -> Option<ChangeEvent>;
}

/// Production implementation backed by `notify`/`notify-debouncer-full`.
///
/// Internally debounces at a fixed, short interval purely to coalesce the
/// burst of events a single save can produce at the OS level (e.g.
/// write+rename); this is independent of — and much shorter than — the
/// Supervisor's own restart debounce, which operates on top of
/// whatever this stream yields.
pub struct NotifyChangeSource {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    // Kept alive so the underlying watcher isn't dropped (which would stop
    // delivering events) for the lifetime of this Change Source.
    _debouncer: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl NotifyChangeSource {
    /// Start watching `paths`. Non-existent paths are tolerated — a
    /// warning is logged and the watch is attempted anyway so it can pick
    /// up the target once it's created.
    pub fn start(paths: &[PathBuf]) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(
            Duration::from_millis(50),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        let kind = classify(&event.event.kind);
                        for path in &event.event.paths {
                            if let Some(kind) = kind {
                                let _ = tx.send(ChangeEvent {
                                    kind,
                                    path: path.clone(),
                                });
                            }
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        // Editors that save via atomic rename trigger
                        // transient "not found" errors mid-cycle; these are
                        // not fatal.
                        warn!(err = %e, "change source error (tolerated)");
                    }
                }
            },
        )
        .map_err(|source| WatchError::WatchSetupFailed {
            path: paths
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            source,
        })?;

        for path in paths {
            if !path.exists() {
                warn!(path = %path.display(), "watch target does not exist yet, watching anyway");
            }
            if let Err(source) = debouncer.watcher().watch(path, RecursiveMode::Recursive) {
                warn!(path = %path.display(), err = %source, "failed to establish watch, continuing with remaining targets");
            }
        }

        Ok(Self {
            rx,
            _debouncer: debouncer,
        })
    }
}

#[async_trait]
impl ChangeSource for NotifyChangeSource {
    async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Modify(_) => Some(ChangeKind::Modify),
        EventKind::Remove(_) => Some(ChangeKind::Remove),
        _ => None,
    }
}

/// Programmable mock used by Supervisor tests: events are pushed through
/// an mpsc sender the test holds directly, with no filesystem involved.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;

    pub struct MockChangeSource {
        rx: mpsc::UnboundedReceiver<ChangeEvent>,
    }

    impl MockChangeSource {
        pub fn new() -> (Self, mpsc::UnboundedSender<ChangeEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { rx }, tx)
        }
    }

    #[async_trait]
    impl ChangeSource for MockChangeSource {
        async fn recv(&mut self) -> Option<ChangeEvent> {
            self.rx.recv().await
        }
    }
}
