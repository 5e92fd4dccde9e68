use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use prism_core::prelude::{FrameCountersSnapshot, PoolStats};

use crate::pipeline_api::BranchState;

const DEFAULT_WINDOW: usize = 120;

/// Rolling timing metrics for a pipeline stage.
///
/// # Example
/// ```rust
/// use prism::prelude::StageMetrics;
///
/// let metrics = StageMetrics::default();
/// metrics.record(std::time::Duration::from_millis(5));
/// assert!(metrics.total_samples() >= 1);
/// ```
#[derive(Default, Clone)]
pub struct StageMetrics {
    inner: Arc<StageState>,
}

#[derive(Default)]
struct StageState {
    count: AtomicU64,
    /// Sample timestamps and durations, newest last.
    window: Mutex<VecDeque<(Instant, u64)>>,
}

impl StageMetrics {
    /// Record a single duration sample.
    pub fn record(&self, dur: Duration) {
        let nanos = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.inner.count.fetch_add(1, Ordering::Relaxed);
        let mut win = self.inner.window.lock();
        win.push_back((Instant::now(), nanos));
        while win.len() > DEFAULT_WINDOW {
            win.pop_front();
        }
    }

    /// Total samples recorded over the lifetime.
    pub fn total_samples(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// Rolling average of samples in milliseconds.
    pub fn avg_millis(&self) -> Option<f64> {
        let win = self.inner.window.lock();
        let count = win.len();
        if count == 0 {
            return None;
        }
        let total: u128 = win.iter().map(|(_, n)| *n as u128).sum();
        Some(total as f64 / 1_000_000.0 / count as f64)
    }

    /// Rolling rate of samples per second, based on sample timestamps.
    pub fn fps(&self) -> Option<f64> {
        let win = self.inner.window.lock();
        if win.len() < 2 {
            return None;
        }
        let first = win.front()?.0;
        let last = win.back()?.0;
        let span = last.saturating_duration_since(first).as_secs_f64();
        if span > 0.0 {
            Some(win.len() as f64 / span)
        } else {
            None
        }
    }
}

/// Point-in-time view of one branch.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BranchStats {
    pub state: BranchState,
    /// Where the headers of the branch pool are.
    pub pool: PoolStats,
    /// Completions delivered by the producer and not yet taken by a capture.
    pub pending_completions: usize,
    pub frames: FrameCountersSnapshot,
    /// Sequence of the most recently captured frame.
    pub last_sequence: Option<u64>,
    /// Captures completed so far.
    pub captures: u64,
    /// Rolling average time spent in `capture_next_frame`.
    pub avg_capture_millis: Option<f64>,
    /// Rolling capture rate over the same window.
    pub capture_fps: Option<f64>,
}
