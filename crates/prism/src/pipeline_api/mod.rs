//! Pipeline construction and the per-branch capture/render handshake.
//!
//! Configure branches on a [`PipelineBuilder`], materialize the stage graph with
//! [`PipelineBuilder::finish_configuration`], then drive each branch through
//! [`Pipeline::capture_next_frame`], [`Pipeline::get_frame`] and
//! [`Pipeline::render_frame`].
//!
//! # Example
//! ```rust
//! use prism::prelude::*;
//! use std::sync::Arc;
//!
//! let platform = Arc::new(VirtualPlatform::builder().source(1280, 720).build());
//! let mut builder = PipelineBuilder::new(platform)?;
//! let small = builder.configure_branch(0, 320, 240, Encoding::RGBA, true)?;
//! let large = builder.configure_branch(0, 1280, 720, Encoding::BGRA, true)?;
//! let pipeline = builder.finish_configuration()?;
//! pipeline.capture_next_frame(small)?;
//! pipeline.capture_next_frame(large)?;
//! assert_eq!(pipeline.get_frame(large)?.format().encoding, Encoding::BGRA);
//! # Ok::<(), prism::prelude::PipelineError>(())
//! ```
mod builder;
mod config;
mod connection;
mod error;
mod frame;
mod pipeline;
mod tunables;

pub use builder::PipelineBuilder;
pub use config::{BranchConfig, BranchHandle, SourceConfig};
pub use error::{ErrorKind, PipelineError};
pub use frame::{BranchState, Frame, FrameMut};
pub use pipeline::{Lifecycle, Pipeline};
pub use tunables::{
    DEFAULT_POOL_MIN, DEFAULT_POOL_SPARE, DEFAULT_UPSTREAM_ENCODING, PRESENTATION_RESERVE,
    PrismConfig, Tunables, set_tunables, set_verbose, tunables, verbose,
};
