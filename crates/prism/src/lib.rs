#![doc = include_str!("../README.md")]

pub use prism_capture as capture;
pub use prism_core as core;

pub use thiserror;

pub mod logging;
mod metrics;
pub mod pipeline_api;

pub use metrics::{BranchStats, StageMetrics};

pub mod prelude {
    pub use crate::metrics::{BranchStats, StageMetrics};
    pub use crate::pipeline_api::{
        BranchConfig, BranchHandle, BranchState, ErrorKind, Frame, FrameMut, Lifecycle,
        PRESENTATION_RESERVE, Pipeline, PipelineBuilder, PipelineError, PrismConfig,
        SourceConfig, Tunables, set_tunables, set_verbose, tunables,
    };
    pub use prism_capture::prelude::*;
}
