use prism_capture::prelude::*;

use super::config::BranchHandle;

/// Failure classes of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Invalid configuration request; nothing was changed.
    Configuration,
    /// Stage, connection or allocation failure; the pipeline is unusable.
    Resource,
    /// A single frame failed; the branch stays usable.
    RuntimeStatus,
    /// Operations called out of order.
    ProtocolMisuse,
    /// The pipeline has been torn down.
    TornDown,
}

/// Errors from configuring or driving a pipeline.
///
/// # Example
/// ```rust
/// use prism::prelude::*;
/// use std::sync::Arc;
///
/// let platform = Arc::new(VirtualPlatform::builder().source(640, 480).build());
/// let mut builder = PipelineBuilder::new(platform).unwrap();
/// let err = builder
///     .configure_branch(0, 1920, 1080, Encoding::RGBA, true)
///     .unwrap_err();
/// assert_eq!(err.kind(), ErrorKind::Configuration);
/// assert_eq!(err.code(), "oversized_request");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("source {index} not present (device has {available})")]
    NoSuchSource { index: usize, available: usize },
    #[error("{width}x{height} exceeds the {max} maximum of source {source_index}")]
    OversizedRequest {
        source_index: usize,
        width: u32,
        height: u32,
        max: Resolution,
    },
    #[error("frame size {width}x{height} is empty")]
    EmptyGeometry { width: u32, height: u32 },
    #[error("encoding {0} is not supported")]
    UnsupportedEncoding(Encoding),
    #[error("source {source_index} already has {max} branches")]
    TooManyBranches { source_index: usize, max: usize },
    #[error("unknown branch {0}")]
    UnknownBranch(BranchHandle),
    #[error("no branch configured")]
    NothingConfigured,
    #[error("platform query failed: {0}")]
    Query(#[source] PlatformError),
    #[error("{step} on {stage} failed: {error}")]
    Stage {
        step: &'static str,
        stage: StageKind,
        #[source]
        error: PlatformError,
    },
    #[error("returning buffers to branch {branch} failed: {error}")]
    Recycle {
        branch: BranchHandle,
        #[source]
        error: PlatformError,
    },
    #[error("capture trigger failed: {0}")]
    Trigger(#[source] PlatformError),
    #[error("frame on branch {branch} completed with flags 0x{flags:x}")]
    FrameStatus { branch: BranchHandle, flags: u32 },
    #[error("handing frame of branch {branch} to presentation failed: {error}")]
    Forward {
        branch: BranchHandle,
        #[source]
        error: PlatformError,
    },
    #[error("branch {0} holds no captured frame")]
    NoFrame(BranchHandle),
    #[error("frame on branch {0} was already rendered")]
    AlreadyRendered(BranchHandle),
    #[error("branch {0} has no presentation stage")]
    NoPresentation(BranchHandle),
    #[error("frame of branch {0} is still borrowed")]
    FrameInUse(BranchHandle),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error("pipeline is torn down")]
    TornDown,
}

impl PipelineError {
    /// Class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::NoSuchSource { .. }
            | PipelineError::OversizedRequest { .. }
            | PipelineError::EmptyGeometry { .. }
            | PipelineError::UnsupportedEncoding(_)
            | PipelineError::TooManyBranches { .. }
            | PipelineError::UnknownBranch(_)
            | PipelineError::NothingConfigured => ErrorKind::Configuration,
            PipelineError::Query(_) | PipelineError::Stage { .. } | PipelineError::Recycle { .. } => {
                ErrorKind::Resource
            }
            PipelineError::Trigger(_)
            | PipelineError::FrameStatus { .. }
            | PipelineError::Forward { .. } => ErrorKind::RuntimeStatus,
            PipelineError::NoFrame(_)
            | PipelineError::AlreadyRendered(_)
            | PipelineError::NoPresentation(_)
            | PipelineError::FrameInUse(_)
            | PipelineError::Ownership(_) => ErrorKind::ProtocolMisuse,
            PipelineError::TornDown => ErrorKind::TornDown,
        }
    }

    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::NoSuchSource { .. } => "no_such_source",
            PipelineError::OversizedRequest { .. } => "oversized_request",
            PipelineError::EmptyGeometry { .. } => "empty_geometry",
            PipelineError::UnsupportedEncoding(_) => "unsupported_encoding",
            PipelineError::TooManyBranches { .. } => "too_many_branches",
            PipelineError::UnknownBranch(_) => "unknown_branch",
            PipelineError::NothingConfigured => "nothing_configured",
            PipelineError::Query(_) => "platform_query_failed",
            PipelineError::Stage { .. } => "stage_failed",
            PipelineError::Recycle { .. } => "recycle_failed",
            PipelineError::Trigger(_) => "trigger_failed",
            PipelineError::FrameStatus { .. } => "frame_status",
            PipelineError::Forward { .. } => "forward_failed",
            PipelineError::NoFrame(_) => "no_frame",
            PipelineError::AlreadyRendered(_) => "already_rendered",
            PipelineError::NoPresentation(_) => "no_presentation",
            PipelineError::FrameInUse(_) => "frame_in_use",
            PipelineError::Ownership(_) => "ownership_violation",
            PipelineError::TornDown => "torn_down",
        }
    }

    /// Whether the same call may succeed when retried.
    pub fn retryable(&self) -> bool {
        self.kind() == ErrorKind::RuntimeStatus
    }

    pub(crate) fn stage(step: &'static str, stage: StageKind) -> impl FnOnce(PlatformError) -> Self {
        move |error| PipelineError::Stage { step, stage, error }
    }
}
