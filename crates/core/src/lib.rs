#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod format;
pub mod metrics;
pub mod queue;

pub mod prelude {
    pub use crate::{
        buffer::{
            BufferFlags, BufferHeader, BufferId, BufferPool, Ownership, OwnershipError, PoolStats,
        },
        format::{Crop, Encoding, HEIGHT_ALIGN, PortFormat, Resolution, WIDTH_ALIGN, align_up},
        metrics::{FrameCounters, FrameCountersSnapshot, PoolMetrics},
        queue::{CompletionRx, CompletionTx, RecvOutcome, SendOutcome, completion_queue},
    };
}
