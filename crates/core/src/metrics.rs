use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for pool traffic.
///
/// # Example
/// ```rust
/// use prism_core::metrics::PoolMetrics;
///
/// let metrics = PoolMetrics::default();
/// metrics.acquired();
/// assert_eq!(metrics.acquired_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct PoolMetrics {
    acquired: AtomicU64,
    exhausted: AtomicU64,
    released: AtomicU64,
}

impl PoolMetrics {
    /// A header left the free list.
    pub fn acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// The free list was empty when a header was requested.
    pub fn exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// A header returned to the free list.
    pub fn released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

/// Per-branch frame counters updated by the capture/render handshake.
///
/// # Example
/// ```rust
/// use prism_core::metrics::FrameCounters;
///
/// let counters = FrameCounters::default();
/// counters.empty_discarded();
/// assert_eq!(counters.snapshot().empty_discarded, 1);
/// ```
#[derive(Debug, Default)]
pub struct FrameCounters {
    delivered: AtomicU64,
    empty_discarded: AtomicU64,
    dropped_unconsumed: AtomicU64,
    rendered: AtomicU64,
    recycled: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`FrameCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameCountersSnapshot {
    pub delivered: u64,
    pub empty_discarded: u64,
    pub dropped_unconsumed: u64,
    pub rendered: u64,
    pub recycled: u64,
    pub failed: u64,
}

impl FrameCounters {
    /// A non-empty frame reached the consumer.
    pub fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// A zero-length completion was swallowed.
    pub fn empty_discarded(&self) {
        self.empty_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// A held frame was released without being rendered.
    pub fn dropped_unconsumed(&self) {
        self.dropped_unconsumed.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame was handed to the presentation stage.
    pub fn rendered(&self) {
        self.rendered.fetch_add(1, Ordering::Relaxed);
    }

    /// `count` free buffers went back to the producing port.
    pub fn recycled(&self, count: usize) {
        self.recycled.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// A completion carried a failure status.
    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FrameCountersSnapshot {
        FrameCountersSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            empty_discarded: self.empty_discarded.load(Ordering::Relaxed),
            dropped_unconsumed: self.dropped_unconsumed.load(Ordering::Relaxed),
            rendered: self.rendered.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
