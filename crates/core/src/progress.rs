use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::DataType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub item_id: String,
    pub data_type: Option<DataType>,
    pub phase: String,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
    pub throughput_bps: Option<u64>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TaskProgress);
}

/// Structured codec progress; the only progress shape the orchestrators consume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveProgress {
    pub bytes_processed: u64,
    pub throughput_bps: u64,
}

/// Forwards progress over a bounded channel, dropping events when the receiver lags.
pub struct ChannelProgressSink {
    tx: mpsc::Sender<TaskProgress>,
    dropped: AtomicU64,
}

impl ChannelProgressSink {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn channel_progress(capacity: usize) -> (ChannelProgressSink, mpsc::Receiver<TaskProgress>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelProgressSink {
            tx,
            dropped: AtomicU64::new(0),
        },
        rx,
    )
}

impl ProgressSink for ChannelProgressSink {
    fn on_progress(&self, progress: TaskProgress) {
        if self.tx.try_send(progress).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Byte counter that rate-limits emitted [`ArchiveProgress`] events.
pub(crate) struct ProgressMeter {
    started: Instant,
    last_emit: Option<Instant>,
    interval: Duration,
    bytes: u64,
}

impl ProgressMeter {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_emit: None,
            interval,
            bytes: 0,
        }
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Adds `n` bytes; returns an event when the emit interval has elapsed.
    pub(crate) fn advance(&mut self, n: u64) -> Option<ArchiveProgress> {
        self.bytes = self.bytes.saturating_add(n);
        let now = Instant::now();
        if let Some(last) = self.last_emit
            && now.duration_since(last) < self.interval
        {
            return None;
        }
        self.last_emit = Some(now);
        Some(self.snapshot())
    }

    pub(crate) fn snapshot(&self) -> ArchiveProgress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput_bps = if elapsed > 0.0 {
            (self.bytes as f64 / elapsed) as u64
        } else {
            0
        };
        ArchiveProgress {
            bytes_processed: self.bytes,
            throughput_bps,
        }
    }
}
