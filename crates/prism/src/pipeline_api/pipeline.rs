use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Instant,
};

use parking_lot::{Mutex, MutexGuard};
use prism_capture::prelude::*;
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use super::{
    builder::StageGraph,
    config::{BranchConfig, BranchHandle},
    connection::{Connection, ForwardError},
    error::PipelineError,
    frame::{BranchState, Frame, FrameContext, FrameMut, ViewMark},
    tunables::verbose,
};
use crate::metrics::{BranchStats, StageMetrics};

/// Pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Lifecycle {
    /// Graph built; captures may run.
    Ready = 0,
    /// Stages destroyed; every call fails with `TornDown`.
    TornDown = 1,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Ready,
            _ => Lifecycle::TornDown,
        }
    }
}

pub(crate) struct SourceRuntime {
    pub(crate) index: usize,
    pub(crate) port: SourcePort,
    /// Source output feeding the splitter.
    pub(crate) output: PortId,
    pub(crate) upstream: PortFormat,
    pub(crate) branches: SmallVec<[BranchRuntime; SPLITTER_OUTPUTS]>,
}

pub(crate) struct BranchRuntime {
    pub(crate) handle: BranchHandle,
    pub(crate) config: BranchConfig,
    pub(crate) format: PortFormat,
    pub(crate) connection: Connection,
    pub(crate) presentation: Option<PortId>,
    pub(crate) frame: Mutex<FrameContext>,
    /// Set while a `Frame` or `FrameMut` of this branch is alive.
    pub(crate) viewing: AtomicBool,
    pub(crate) counters: FrameCounters,
    pub(crate) wait: StageMetrics,
}

impl BranchRuntime {
    pub(crate) fn new(
        handle: BranchHandle,
        config: BranchConfig,
        format: PortFormat,
        connection: Connection,
        presentation: Option<PortId>,
    ) -> Self {
        Self {
            handle,
            config,
            format,
            connection,
            presentation,
            frame: Mutex::new(FrameContext::default()),
            viewing: AtomicBool::new(false),
            counters: FrameCounters::default(),
            wait: StageMetrics::default(),
        }
    }

    /// Lock the handshake state, refusing while a frame view is alive.
    fn lock_frame(&self) -> Result<MutexGuard<'_, FrameContext>, PipelineError> {
        if self.viewing.load(Ordering::Acquire) {
            return Err(PipelineError::FrameInUse(self.handle));
        }
        Ok(self.frame.lock())
    }
}

/// A built fan-out pipeline: source, splitter, and per branch a processor with an
/// optional presentation stage.
///
/// Each branch is driven through `capture_next_frame`, then `get_frame` or
/// `get_frame_mut`, then optionally `render_frame`. Different branches may be driven
/// from different threads; a single branch from one thread at a time.
///
/// # Example
/// ```rust
/// use prism::prelude::*;
/// use std::sync::Arc;
///
/// let platform = Arc::new(VirtualPlatform::builder().source(640, 480).build());
/// let mut builder = PipelineBuilder::new(platform)?;
/// let branch = builder.configure_branch(0, 320, 240, Encoding::RGBA, false)?;
/// let pipeline = builder.finish_configuration()?;
/// for _ in 0..3 {
///     pipeline.capture_next_frame(branch)?;
///     let frame = pipeline.get_frame(branch)?;
///     assert!(!frame.is_empty());
/// }
/// pipeline.teardown();
/// # Ok::<(), prism::prelude::PipelineError>(())
/// ```
pub struct Pipeline {
    platform: Arc<dyn Platform>,
    graph: Mutex<StageGraph>,
    sources: SmallVec<[SourceRuntime; 2]>,
    lifecycle: AtomicU8,
}

impl Pipeline {
    pub(crate) fn new(
        platform: Arc<dyn Platform>,
        graph: StageGraph,
        sources: SmallVec<[SourceRuntime; 2]>,
    ) -> Self {
        Self {
            platform,
            graph: Mutex::new(graph),
            sources,
            lifecycle: AtomicU8::new(Lifecycle::Ready as u8),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Every configured branch, in source then splitter-output order.
    pub fn branches(&self) -> Vec<BranchHandle> {
        self.sources
            .iter()
            .flat_map(|s| s.branches.iter().map(|b| b.handle))
            .collect()
    }

    /// Format shared by the source, the splitter and the processor inputs of `source`.
    pub fn upstream_format(&self, source: usize) -> Option<PortFormat> {
        self.sources
            .iter()
            .find(|s| s.index == source)
            .map(|s| s.upstream)
    }

    /// Format negotiated on the processor output of `branch`.
    pub fn branch_format(&self, branch: BranchHandle) -> Result<PortFormat, PipelineError> {
        Ok(self.branch(branch)?.1.format)
    }

    pub fn branch_config(&self, branch: BranchHandle) -> Result<BranchConfig, PipelineError> {
        Ok(self.branch(branch)?.1.config)
    }

    pub fn screen_size(&self) -> Result<Resolution, PipelineError> {
        self.platform.screen_size().map_err(PipelineError::Query)
    }

    /// Block until `branch` holds a fresh, non-empty frame.
    ///
    /// A frame captured earlier and never rendered is released first. Zero-length
    /// completions are recycled and waited past. A completion that carries a failure
    /// flag is still stored; `get_frame` and `render_frame` report it.
    pub fn capture_next_frame(&self, branch: BranchHandle) -> Result<(), PipelineError> {
        self.ensure_ready()?;
        let (source, rt) = self.branch(branch)?;
        let mut ctx = rt.lock_frame()?;
        let started = Instant::now();
        if let Some(unconsumed) = ctx.begin_capture() {
            drop(unconsumed);
            rt.counters.dropped_unconsumed();
            if verbose() {
                debug!(%branch, "unconsumed frame dropped");
            }
        }

        match self.await_frame(source, rt) {
            Ok(buffer) => {
                rt.counters.delivered();
                if buffer.flags().is_failure() {
                    rt.counters.failed();
                    warn!(
                        %branch,
                        sequence = buffer.sequence(),
                        flags = buffer.flags().bits(),
                        "frame completed with failure status"
                    );
                } else if verbose() {
                    debug!(
                        %branch,
                        sequence = buffer.sequence(),
                        len = buffer.len(),
                        "frame ready"
                    );
                }
                ctx.store(buffer);
                rt.wait.record(started.elapsed());
                Ok(())
            }
            Err(err) => {
                ctx.abort_capture();
                if self.lifecycle() == Lifecycle::TornDown {
                    return Err(PipelineError::TornDown);
                }
                warn!(%branch, error = %err, "capture failed");
                Err(err)
            }
        }
    }

    /// Runs [`Pipeline::capture_next_frame`] on a multi-threaded tokio runtime without
    /// stalling its other tasks.
    #[cfg(feature = "async")]
    pub async fn capture_next_frame_async(
        &self,
        branch: BranchHandle,
    ) -> Result<(), PipelineError> {
        tokio::task::block_in_place(|| self.capture_next_frame(branch))
    }

    fn await_frame(
        &self,
        source: &SourceRuntime,
        rt: &BranchRuntime,
    ) -> Result<BufferHeader, PipelineError> {
        let stale = rt.connection.discard_stale();
        if stale > 0 && verbose() {
            trace!(branch = %rt.handle, stale, "stale completions released");
        }
        self.recycle(rt)?;
        if source.port == SourcePort::Capture {
            self.platform
                .trigger_capture(source.output)
                .map_err(PipelineError::Trigger)?;
        }
        loop {
            let buffer = rt.connection.wait_for_completed_buffer()?;
            if !buffer.is_empty() {
                return Ok(buffer);
            }
            rt.counters.empty_discarded();
            if verbose() {
                trace!(branch = %rt.handle, sequence = buffer.sequence(), "empty completion");
            }
            drop(buffer);
            self.recycle(rt)?;
        }
    }

    fn recycle(&self, rt: &BranchRuntime) -> Result<(), PipelineError> {
        let sent = rt
            .connection
            .drain_free_buffers_to_port()
            .map_err(|error| PipelineError::Recycle {
                branch: rt.handle,
                error,
            })?;
        rt.counters.recycled(sent);
        Ok(())
    }

    /// Borrow the frame `branch` holds. Never blocks on the producer.
    ///
    /// Until the view is dropped, every other call on `branch` fails with `FrameInUse`.
    pub fn get_frame(&self, branch: BranchHandle) -> Result<Frame<'_>, PipelineError> {
        self.ensure_ready()?;
        let (_, rt) = self.branch(branch)?;
        let ctx = rt.lock_frame()?;
        ctx.check_ready(branch)?;
        let buffer = MutexGuard::try_map(ctx, FrameContext::held_mut)
            .map_err(|_| PipelineError::NoFrame(branch))?;
        Ok(Frame {
            _mark: ViewMark::new(&rt.viewing),
            buffer,
            format: rt.format,
        })
    }

    /// Mutable access to the held frame, for editing in place before rendering.
    pub fn get_frame_mut(&self, branch: BranchHandle) -> Result<FrameMut<'_>, PipelineError> {
        self.ensure_ready()?;
        let (_, rt) = self.branch(branch)?;
        let ctx = rt.lock_frame()?;
        ctx.check_ready(branch)?;
        let buffer = MutexGuard::try_map(ctx, FrameContext::held_mut)
            .map_err(|_| PipelineError::NoFrame(branch))?;
        Ok(FrameMut {
            _mark: ViewMark::new(&rt.viewing),
            buffer,
            format: rt.format,
        })
    }

    /// Hand the held frame to the branch's presentation stage.
    ///
    /// Each captured frame renders at most once. When the stage refuses the buffer the
    /// frame stays held and the call may be retried.
    pub fn render_frame(&self, branch: BranchHandle) -> Result<(), PipelineError> {
        self.ensure_ready()?;
        let (_, rt) = self.branch(branch)?;
        let presentation = rt.presentation.ok_or(PipelineError::NoPresentation(branch))?;
        let mut ctx = rt.lock_frame()?;
        let mut buffer = ctx.take_for_render(branch)?;
        let flags = buffer.flags();
        let sequence = buffer.sequence();
        let mut marked = flags;
        marked.insert(BufferFlags::EOS);
        buffer.set_flags(marked);

        match rt.connection.send_buffer_downstream(presentation, buffer) {
            Ok(()) => {
                ctx.mark_forwarded();
                rt.counters.rendered();
                if verbose() {
                    debug!(%branch, sequence, "frame rendered");
                }
                Ok(())
            }
            Err(ForwardError::Refused(error, mut buffer)) => {
                buffer.set_flags(flags);
                ctx.restore(buffer);
                warn!(%branch, sequence, error = %error, "presentation refused frame");
                Err(PipelineError::Forward { branch, error })
            }
            Err(ForwardError::NotHeld(error, mut buffer)) => {
                buffer.set_flags(flags);
                ctx.restore(buffer);
                Err(error.into())
            }
        }
    }

    /// Release the held frame without rendering it. Returns whether one was held.
    pub fn release_frame(&self, branch: BranchHandle) -> Result<bool, PipelineError> {
        let (_, rt) = self.branch(branch)?;
        let released = rt.lock_frame()?.release();
        match released {
            Some(buffer) => {
                drop(buffer);
                rt.counters.dropped_unconsumed();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn branch_state(&self, branch: BranchHandle) -> Result<BranchState, PipelineError> {
        let (_, rt) = self.branch(branch)?;
        Ok(rt.lock_frame()?.state())
    }

    /// Counters, pool ledger and capture timing of `branch`.
    pub fn branch_stats(&self, branch: BranchHandle) -> Result<BranchStats, PipelineError> {
        let (_, rt) = self.branch(branch)?;
        let (state, last_sequence) = {
            let ctx = rt.lock_frame()?;
            (ctx.state(), ctx.last_sequence())
        };
        Ok(BranchStats {
            state,
            pool: rt.connection.stats(),
            pending_completions: rt.connection.pending(),
            frames: rt.counters.snapshot(),
            last_sequence,
            captures: rt.wait.total_samples(),
            avg_capture_millis: rt.wait.avg_millis(),
            capture_fps: rt.wait.fps(),
        })
    }

    /// Rolling capture wait times of `branch`.
    pub fn capture_metrics(&self, branch: BranchHandle) -> Result<StageMetrics, PipelineError> {
        Ok(self.branch(branch)?.1.wait.clone())
    }

    /// Destroy every stage and wake blocked captures, which return `TornDown`.
    ///
    /// Safe to call from any thread and more than once.
    pub fn teardown(&self) {
        let swapped = self.lifecycle.compare_exchange(
            Lifecycle::Ready as u8,
            Lifecycle::TornDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_err() {
            return;
        }
        for source in &self.sources {
            for branch in &source.branches {
                branch.connection.close();
            }
        }
        self.graph.lock().dismantle();
        for source in &self.sources {
            // A branch lent to a live view keeps its frame until the pipeline drops.
            for branch in source.branches.iter().filter(|b| !b.viewing.load(Ordering::Acquire)) {
                drop(branch.frame.lock().release());
            }
        }
        info!("pipeline torn down");
    }

    fn ensure_ready(&self) -> Result<(), PipelineError> {
        match self.lifecycle() {
            Lifecycle::Ready => Ok(()),
            _ => Err(PipelineError::TornDown),
        }
    }

    fn branch(
        &self,
        handle: BranchHandle,
    ) -> Result<(&SourceRuntime, &BranchRuntime), PipelineError> {
        self.sources
            .iter()
            .find(|s| s.index == handle.source())
            .and_then(|s| s.branches.get(handle.index()).map(|b| (s, b)))
            .ok_or(PipelineError::UnknownBranch(handle))
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_api::{ErrorKind, PipelineBuilder};

    fn single_branch(presentation: bool) -> (Arc<VirtualPlatform>, Pipeline, BranchHandle) {
        let platform = Arc::new(VirtualPlatform::builder().source(640, 480).build());
        let mut builder = PipelineBuilder::new(platform.clone()).unwrap();
        let branch = builder
            .configure_branch(0, 320, 240, Encoding::RGBA, true)
            .unwrap();
        if presentation {
            builder
                .configure_presentation(branch, DisplayRegion::fullscreen(1))
                .unwrap();
        }
        let pipeline = builder.finish_configuration().unwrap();
        (platform, pipeline, branch)
    }

    #[test]
    fn get_before_capture_is_misuse() {
        let (_platform, pipeline, branch) = single_branch(false);
        assert_eq!(pipeline.lifecycle(), Lifecycle::Ready);
        assert!(matches!(
            pipeline.get_frame(branch),
            Err(PipelineError::NoFrame(_))
        ));
        assert_eq!(pipeline.branch_state(branch).unwrap(), BranchState::Idle);
    }

    #[test]
    fn render_without_presentation_fails() {
        let (_platform, pipeline, branch) = single_branch(false);
        pipeline.capture_next_frame(branch).unwrap();
        assert!(matches!(
            pipeline.render_frame(branch),
            Err(PipelineError::NoPresentation(_))
        ));
        assert_eq!(pipeline.branch_state(branch).unwrap(), BranchState::FrameReady);
    }

    #[test]
    fn release_recycles_held_frame() {
        let (_platform, pipeline, branch) = single_branch(false);
        pipeline.capture_next_frame(branch).unwrap();
        assert!(pipeline.release_frame(branch).unwrap());
        assert!(!pipeline.release_frame(branch).unwrap());
        assert_eq!(pipeline.branch_state(branch).unwrap(), BranchState::Recycled);
        let stats = pipeline.branch_stats(branch).unwrap();
        assert_eq!(stats.frames.dropped_unconsumed, 1);
        assert_eq!(stats.pool.held, 0);
        assert_eq!(stats.pool.free + stats.pool.in_flight, stats.pool.total);
    }

    #[test]
    fn live_view_blocks_other_calls_instead_of_deadlocking() {
        let (_platform, pipeline, branch) = single_branch(true);
        pipeline.capture_next_frame(branch).unwrap();
        let frame = pipeline.get_frame(branch).unwrap();
        assert!(!frame.as_ptr().is_null());
        for err in [
            pipeline.render_frame(branch).unwrap_err(),
            pipeline.capture_next_frame(branch).unwrap_err(),
            pipeline.get_frame_mut(branch).unwrap_err(),
            pipeline.branch_state(branch).unwrap_err(),
        ] {
            assert!(matches!(err, PipelineError::FrameInUse(_)));
            assert_eq!(err.kind(), ErrorKind::ProtocolMisuse);
        }
        drop(frame);
        pipeline.render_frame(branch).unwrap();
        assert_eq!(pipeline.branch_state(branch).unwrap(), BranchState::Rendered);
    }

    #[test]
    fn unknown_branch_is_rejected() {
        let (_platform, pipeline, _) = single_branch(false);
        let ghost = BranchHandle::new(0, 3);
        assert!(matches!(
            pipeline.capture_next_frame(ghost),
            Err(PipelineError::UnknownBranch(_))
        ));
    }

    #[test]
    fn teardown_is_idempotent() {
        let (platform, pipeline, branch) = single_branch(true);
        pipeline.capture_next_frame(branch).unwrap();
        pipeline.teardown();
        pipeline.teardown();
        assert_eq!(pipeline.lifecycle(), Lifecycle::TornDown);
        assert!(platform.live_stages().is_empty());
        assert!(matches!(
            pipeline.capture_next_frame(branch),
            Err(PipelineError::TornDown)
        ));
        // A completion already on its way back lands in the closed queue and is freed.
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        loop {
            let stats = pipeline.branch_stats(branch).unwrap();
            if stats.pool.free == stats.pool.total || Instant::now() > deadline {
                assert_eq!(stats.pool.free, stats.pool.total);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }
}
