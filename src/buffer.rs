//! Message Buffer — FIFO holding queue for client-originated frames
//! that arrive while no server is attached.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::warn;

/// One buffered frame: the raw line bytes plus when it was enqueued.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub line: String,
    pub enqueued_at: Instant,
}

/// FIFO queue of client-originated frames awaiting a Ready server.
///
/// The default policy is unbounded with a soft warning at `warn_watermark`
/// entries; callers may additionally set a hard `capacity` to
/// actually drop the oldest frames once exceeded.
#[derive(Debug)]
pub struct MessageBuffer {
    entries: VecDeque<BufferedFrame>,
    warn_watermark: usize,
    capacity: Option<usize>,
    warned: bool,
}

impl MessageBuffer {
    pub fn new(warn_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            warn_watermark,
            capacity: None,
            warned: false,
        }
    }

    /// Set a hard upper bound. When exceeded, the oldest frame is dropped.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Enqueue a client-originated frame.
    pub fn enqueue(&mut self, line: String) {
        self.entries.push_back(BufferedFrame {
            line,
            enqueued_at: Instant::now(),
        });

        if self.entries.len() >= self.warn_watermark && !self.warned {
            warn!(
                size = self.entries.len(),
                watermark = self.warn_watermark,
                "message buffer above soft watermark — server restart is taking a while"
            );
            self.warned = true;
        }

        if let Some(cap) = self.capacity {
            while self.entries.len() > cap {
                self.entries.pop_front();
                warn!(capacity = cap, "message buffer at hard capacity, dropping oldest frame");
            }
        }
    }

    /// Drain all buffered frames in FIFO order.
    pub fn drain_all(&mut self) -> Vec<BufferedFrame> {
        self.warned = false;
        self.entries.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
