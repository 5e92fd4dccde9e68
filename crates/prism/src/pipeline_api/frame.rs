use std::{
    fmt,
    ops::Deref,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::MappedMutexGuard;
use prism_capture::prelude::*;

use super::{config::BranchHandle, error::PipelineError};

/// Where a branch is in the capture/render handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BranchState {
    /// Nothing captured yet.
    #[default]
    Idle,
    /// Waiting for the producer.
    CaptureRequested,
    /// A frame is held by the consumer.
    FrameReady,
    /// The held frame went to the presentation stage.
    Rendered,
    /// The held frame went back to the pool without being shown.
    Recycled,
}

/// Per-branch handshake state: the held buffer, its completion status and whether it
/// has been forwarded.
#[derive(Debug, Default)]
pub(crate) struct FrameContext {
    held: Option<BufferHeader>,
    status: BufferFlags,
    forwarded: bool,
    state: BranchState,
    last_sequence: Option<u64>,
}

impl FrameContext {
    pub(crate) fn state(&self) -> BranchState {
        self.state
    }

    pub(crate) fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Enter `CaptureRequested`, handing back a frame that was captured but never shown.
    pub(crate) fn begin_capture(&mut self) -> Option<BufferHeader> {
        let unconsumed = self.held.take();
        self.forwarded = false;
        self.status = BufferFlags::NONE;
        self.state = BranchState::CaptureRequested;
        unconsumed
    }

    /// Store a completed non-empty buffer and its status.
    pub(crate) fn store(&mut self, buffer: BufferHeader) {
        self.status = buffer.flags();
        self.last_sequence = Some(buffer.sequence());
        self.held = Some(buffer);
        self.forwarded = false;
        self.state = BranchState::FrameReady;
    }

    /// A capture that ended without a frame leaves the branch idle.
    pub(crate) fn abort_capture(&mut self) {
        if self.state == BranchState::CaptureRequested {
            self.state = BranchState::Idle;
        }
    }

    /// Check that a frame with a success status is held.
    pub(crate) fn check_ready(&self, branch: BranchHandle) -> Result<(), PipelineError> {
        match self.state {
            BranchState::FrameReady if self.held.is_some() => {}
            BranchState::Rendered if self.forwarded => {
                return Err(PipelineError::AlreadyRendered(branch));
            }
            _ => return Err(PipelineError::NoFrame(branch)),
        }
        if self.status.is_failure() {
            return Err(PipelineError::FrameStatus {
                branch,
                flags: self.status.bits(),
            });
        }
        Ok(())
    }

    /// Take the held buffer for forwarding.
    pub(crate) fn take_for_render(
        &mut self,
        branch: BranchHandle,
    ) -> Result<BufferHeader, PipelineError> {
        self.check_ready(branch)?;
        self.held.take().ok_or(PipelineError::NoFrame(branch))
    }

    /// Forwarding succeeded; the presentation stage owns the buffer now.
    pub(crate) fn mark_forwarded(&mut self) {
        self.forwarded = true;
        self.state = BranchState::Rendered;
    }

    /// Forwarding failed; keep holding the buffer.
    pub(crate) fn restore(&mut self, buffer: BufferHeader) {
        self.held = Some(buffer);
        self.state = BranchState::FrameReady;
    }

    /// Give up the held frame without showing it.
    pub(crate) fn release(&mut self) -> Option<BufferHeader> {
        let buffer = self.held.take()?;
        self.state = BranchState::Recycled;
        Some(buffer)
    }

    pub(crate) fn held_mut(&mut self) -> Option<&mut BufferHeader> {
        self.held.as_mut()
    }
}

/// Marks a branch as lent out to a frame view until dropped.
pub(crate) struct ViewMark<'a>(&'a AtomicBool);

impl<'a> ViewMark<'a> {
    pub(crate) fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ViewMark<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Read view of the frame a branch currently holds.
///
/// While the view is alive, other calls on the same branch fail with `FrameInUse`.
pub struct Frame<'a> {
    pub(crate) _mark: ViewMark<'a>,
    pub(crate) buffer: MappedMutexGuard<'a, BufferHeader>,
    pub(crate) format: PortFormat,
}

impl Frame<'_> {
    /// Payload bytes, laid out per [`Frame::format`].
    pub fn data(&self) -> &[u8] {
        self.buffer.payload()
    }

    /// Address of the first payload byte; stable while the frame is held.
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Format negotiated on the branch's processor output.
    pub fn format(&self) -> PortFormat {
        self.format
    }

    /// Producer-assigned frame number.
    pub fn sequence(&self) -> u64 {
        self.buffer.sequence()
    }

    pub fn flags(&self) -> BufferFlags {
        self.buffer.flags()
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence())
            .field("len", &self.len())
            .field("format", &self.format)
            .finish()
    }
}

impl Deref for Frame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

/// Mutable view of the held frame, for editing in place before rendering.
pub struct FrameMut<'a> {
    pub(crate) _mark: ViewMark<'a>,
    pub(crate) buffer: MappedMutexGuard<'a, BufferHeader>,
    pub(crate) format: PortFormat,
}

impl FrameMut<'_> {
    pub fn data(&self) -> &[u8] {
        self.buffer.payload()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buffer.payload_mut()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn format(&self) -> PortFormat {
        self.format
    }

    pub fn sequence(&self) -> u64 {
        self.buffer.sequence()
    }
}

impl fmt::Debug for FrameMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameMut")
            .field("sequence", &self.sequence())
            .field("len", &self.len())
            .field("format", &self.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(pool: &BufferPool, len: usize, flags: BufferFlags) -> BufferHeader {
        let mut buffer = pool.acquire().unwrap();
        buffer.set_len(len);
        buffer.set_flags(flags);
        buffer.set_sequence(7);
        buffer
            .transition(Ownership::InFlight, Ownership::Held)
            .unwrap();
        buffer
    }

    #[test]
    fn idle_context_has_no_frame() {
        let ctx = FrameContext::default();
        let branch = BranchHandle::new(0, 0);
        assert!(matches!(
            ctx.check_ready(branch),
            Err(PipelineError::NoFrame(_))
        ));
        assert_eq!(ctx.state(), BranchState::Idle);
    }

    #[test]
    fn render_once_per_capture() {
        let pool = BufferPool::new(2, 16);
        let branch = BranchHandle::new(0, 0);
        let mut ctx = FrameContext::default();
        assert!(ctx.begin_capture().is_none());
        ctx.store(completed(&pool, 16, BufferFlags::FRAME_END));
        assert_eq!(ctx.last_sequence(), Some(7));
        let buffer = ctx.take_for_render(branch).unwrap();
        drop(buffer);
        ctx.mark_forwarded();
        assert!(matches!(
            ctx.take_for_render(branch),
            Err(PipelineError::AlreadyRendered(_))
        ));
    }

    #[test]
    fn failed_status_blocks_access() {
        let pool = BufferPool::new(1, 16);
        let branch = BranchHandle::new(0, 0);
        let mut ctx = FrameContext::default();
        ctx.begin_capture();
        ctx.store(completed(&pool, 16, BufferFlags::TRANSMISSION_FAILED));
        let err = ctx.check_ready(branch).unwrap_err();
        assert!(err.retryable());
        // The failed buffer is still released by the next capture.
        let stale = ctx.begin_capture();
        assert!(stale.is_some());
        assert_eq!(pool.stats().held, 1);
        drop(stale);
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn restore_after_failed_forward() {
        let pool = BufferPool::new(1, 16);
        let branch = BranchHandle::new(0, 0);
        let mut ctx = FrameContext::default();
        ctx.begin_capture();
        ctx.store(completed(&pool, 16, BufferFlags::FRAME_END));
        let buffer = ctx.take_for_render(branch).unwrap();
        ctx.restore(buffer);
        assert_eq!(ctx.state(), BranchState::FrameReady);
        assert!(ctx.check_ready(branch).is_ok());
        assert!(ctx.release().is_some());
        assert_eq!(ctx.state(), BranchState::Recycled);
    }
}
