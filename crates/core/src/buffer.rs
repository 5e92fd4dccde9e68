use crossbeam_queue::ArrayQueue;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use crate::metrics::PoolMetrics;

/// Stable identifier of a buffer header inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Who currently owns a buffer header.
///
/// Every header of a pool is in exactly one of these states at any instant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Parked in the pool's free list.
    Free = 0,
    /// Handed to a stage port to be filled, or filled and waiting in a completion queue.
    InFlight = 1,
    /// Taken by the consumer.
    Held = 2,
    /// Handed to a presentation stage.
    Forwarded = 3,
}

impl Ownership {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Ownership::InFlight,
            2 => Ownership::Held,
            3 => Ownership::Forwarded,
            _ => Ownership::Free,
        }
    }
}

/// Illegal ownership transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer {id:?} is {actual:?}, expected {expected:?}")]
pub struct OwnershipError {
    pub id: BufferId,
    pub expected: Ownership,
    pub actual: Ownership,
}

/// Flags carried by a buffer header between stages.
///
/// # Example
/// ```rust
/// use prism_core::prelude::BufferFlags;
///
/// let mut flags = BufferFlags::FRAME_END;
/// flags.insert(BufferFlags::TRANSMISSION_FAILED);
/// assert!(flags.is_failure());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    /// Last buffer of a stream.
    pub const EOS: BufferFlags = BufferFlags(1 << 0);
    /// Buffer completes a frame.
    pub const FRAME_END: BufferFlags = BufferFlags(1 << 2);
    /// Stage failed to fill the buffer.
    pub const TRANSMISSION_FAILED: BufferFlags = BufferFlags(1 << 3);
    /// Payload is known to be damaged.
    pub const CORRUPTED: BufferFlags = BufferFlags(1 << 4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }

    /// Whether the producing stage reported a failure for this buffer.
    pub const fn is_failure(self) -> bool {
        self.0 & (Self::TRANSMISSION_FAILED.0 | Self::CORRUPTED.0) != 0
    }
}

/// Header of a pooled, pre-allocated buffer.
///
/// A header is moved by value between the pool, stage ports, completion queues and the
/// consumer, so it has a single owner at any time. Dropping it releases the buffer back to
/// the free list of the originating pool.
pub struct BufferHeader {
    pool: Arc<PoolInner>,
    id: BufferId,
    data: Option<Vec<u8>>,
    length: usize,
    flags: BufferFlags,
    sequence: u64,
}

impl BufferHeader {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Current ownership state as recorded by the pool.
    pub fn ownership(&self) -> Ownership {
        self.pool.state(self.id)
    }

    /// Move the header from `from` to `to`, failing if it is not currently in `from`.
    pub fn transition(&self, from: Ownership, to: Ownership) -> Result<(), OwnershipError> {
        self.pool.transition(self.id, from, to)
    }

    /// Valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        let data = self.data.as_deref().unwrap_or(&[]);
        &data[..self.length.min(data.len())]
    }

    /// Mutable view of the valid payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.length;
        let data = self.data.as_deref_mut().unwrap_or(&mut []);
        let end = len.min(data.len());
        &mut data[..end]
    }

    /// Whole allocation, regardless of the payload length; producers fill this.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Pointer to the first payload byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.payload().as_ptr()
    }

    /// Allocated size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Set the payload length, clamped to the allocation.
    pub fn set_len(&mut self, len: usize) {
        self.length = len.min(self.capacity());
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.flags = flags;
    }

    /// Producer-assigned frame number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Whether this header came from `pool`.
    pub fn belongs_to(&self, pool: &BufferPool) -> bool {
        Arc::ptr_eq(&self.pool, &pool.inner)
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("id", &self.id)
            .field("length", &self.length)
            .field("capacity", &self.capacity())
            .field("flags", &self.flags)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Drop for BufferHeader {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.recycle(self.id, data);
        }
    }
}

/// Snapshot of where the headers of a pool currently are.
///
/// `free + in_flight + held + forwarded == total` for every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub in_flight: usize,
    pub held: usize,
    pub forwarded: usize,
}

/// Fixed-size pool of buffer headers with per-header ownership tracking.
///
/// # Example
/// ```rust
/// use prism_core::prelude::{BufferPool, Ownership};
///
/// let pool = BufferPool::new(2, 1024);
/// let header = pool.acquire().unwrap();
/// assert_eq!(header.ownership(), Ownership::InFlight);
/// assert_eq!(pool.stats().free, 1);
/// drop(header);
/// assert_eq!(pool.stats().free, 2);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with `count` preallocated headers of `buffer_size` bytes each.
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let count = count.max(1);
        let free = ArrayQueue::new(count);
        let mut states = Vec::with_capacity(count);
        for idx in 0..count {
            states.push(AtomicU8::new(Ownership::Free as u8));
            let _ = free.push(Slot {
                id: BufferId(idx as u32),
                data: vec![0; buffer_size],
            });
        }
        Self {
            inner: Arc::new(PoolInner {
                free,
                states: states.into_boxed_slice(),
                buffer_size,
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// Take a header out of the free list; it leaves the pool as `InFlight`.
    pub fn acquire(&self) -> Option<BufferHeader> {
        let Some(slot) = self.inner.free.pop() else {
            self.inner.metrics.exhausted();
            return None;
        };
        self.inner.metrics.acquired();
        self.inner.states[slot.id.0 as usize].store(Ownership::InFlight as u8, Ordering::Release);
        Some(BufferHeader {
            pool: self.inner.clone(),
            id: slot.id,
            data: Some(slot.data),
            length: 0,
            flags: BufferFlags::NONE,
            sequence: 0,
        })
    }

    /// Number of headers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.inner.states.len()
    }

    /// Size in bytes of every header's allocation.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Headers currently parked in the free list.
    pub fn free_len(&self) -> usize {
        self.inner.free.len()
    }

    /// Count headers per ownership state.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.capacity(),
            ..PoolStats::default()
        };
        for state in self.inner.states.iter() {
            match Ownership::from_u8(state.load(Ordering::Acquire)) {
                Ownership::Free => stats.free += 1,
                Ownership::InFlight => stats.in_flight += 1,
                Ownership::Held => stats.held += 1,
                Ownership::Forwarded => stats.forwarded += 1,
            }
        }
        stats
    }

    /// Acquire/release counters for this pool.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("buffer_size", &self.buffer_size())
            .field("stats", &self.stats())
            .finish()
    }
}

struct Slot {
    id: BufferId,
    data: Vec<u8>,
}

struct PoolInner {
    free: ArrayQueue<Slot>,
    states: Box<[AtomicU8]>,
    buffer_size: usize,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn state(&self, id: BufferId) -> Ownership {
        Ownership::from_u8(self.states[id.0 as usize].load(Ordering::Acquire))
    }

    fn transition(&self, id: BufferId, from: Ownership, to: Ownership) -> Result<(), OwnershipError> {
        self.states[id.0 as usize]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| OwnershipError {
                id,
                expected: from,
                actual: Ownership::from_u8(actual),
            })
    }

    fn recycle(&self, id: BufferId, data: Vec<u8>) {
        self.states[id.0 as usize].store(Ownership::Free as u8, Ordering::Release);
        self.metrics.released();
        // Only headers minted by this pool come back, so the queue never overflows.
        let _ = self.free.push(Slot { id, data });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_ledger() {
        let pool = BufferPool::new(3, 16);
        let header = pool.acquire().unwrap();
        header.transition(Ownership::InFlight, Ownership::Held).unwrap();
        let err = header
            .transition(Ownership::InFlight, Ownership::Held)
            .unwrap_err();
        assert_eq!(err.actual, Ownership::Held);
        header.transition(Ownership::Held, Ownership::Forwarded).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.free, 2);
        assert_eq!(stats.free, pool.free_len());
    }

    #[test]
    fn ledger_matches_free_list() {
        let pool = BufferPool::new(4, 8);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        b.transition(Ownership::InFlight, Ownership::Held).unwrap();
        let c = pool.acquire().unwrap();
        c.transition(Ownership::InFlight, Ownership::Held).unwrap();
        c.transition(Ownership::Held, Ownership::Forwarded).unwrap();
        let stats = pool.stats();
        assert_eq!((stats.in_flight, stats.held, stats.forwarded), (1, 1, 1));
        assert_eq!(stats.free, pool.free_len());

        drop(c);
        drop(a);
        let stats = pool.stats();
        assert_eq!(stats.free, 3);
        assert_eq!(stats.free, pool.free_len());
        drop(b);
        assert_eq!(pool.free_len(), pool.capacity());
        assert_eq!(pool.stats().free, pool.capacity());
    }

    #[test]
    fn drop_returns_header_to_free_list() {
        let pool = BufferPool::new(2, 8);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.metrics().exhausted_count(), 1);
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(pool.metrics().released_count(), 2);
    }

    #[test]
    fn payload_is_clamped_to_allocation() {
        let pool = BufferPool::new(1, 8);
        let mut header = pool.acquire().unwrap();
        assert!(header.is_empty());
        header.set_len(64);
        assert_eq!(header.len(), 8);
        header.payload_mut().fill(7);
        assert_eq!(header.payload(), &[7; 8]);
        assert!(header.belongs_to(&pool));
    }

    #[test]
    fn reacquired_header_is_reset() {
        let pool = BufferPool::new(1, 4);
        let mut header = pool.acquire().unwrap();
        header.set_len(4);
        header.set_flags(BufferFlags::FRAME_END);
        header.set_sequence(9);
        drop(header);
        let header = pool.acquire().unwrap();
        assert_eq!(header.len(), 0);
        assert_eq!(header.flags(), BufferFlags::NONE);
        assert_eq!(header.sequence(), 0);
    }
}
