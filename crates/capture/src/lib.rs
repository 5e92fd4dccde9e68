#![doc = include_str!("../README.md")]

use std::{fmt, sync::Arc};

use prism_core::prelude::*;

/// Identifier of a stage created on a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

/// Identifier of a stage port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Identifier of a connection between two ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

/// Kinds of stages a pipeline is built from.
///
/// # Example
/// ```rust
/// use prism_capture::prelude::*;
///
/// assert_eq!(StageKind::Splitter.port_count(PortDirection::Output), 4);
/// assert_eq!(StageKind::Presentation.port_count(PortDirection::Output), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StageKind {
    /// Camera sensor interface: preview, video and capture outputs.
    Source,
    /// Fan-out duplicating one input to up to four outputs.
    Splitter,
    /// Per-branch format and scale conversion.
    Processor,
    /// On-screen renderer.
    Presentation,
    /// Accepts buffers and frees them immediately.
    DiscardSink,
}

/// Maximum number of splitter outputs, and so of branches per source.
pub const SPLITTER_OUTPUTS: usize = 4;

impl StageKind {
    /// Number of ports of `direction` this kind of stage exposes.
    pub fn port_count(self, direction: PortDirection) -> usize {
        match (self, direction) {
            (_, PortDirection::Control) => 1,
            (StageKind::Source, PortDirection::Input) => 0,
            (StageKind::Source, PortDirection::Output) => 3,
            (StageKind::Splitter, PortDirection::Input) => 1,
            (StageKind::Splitter, PortDirection::Output) => SPLITTER_OUTPUTS,
            (StageKind::Processor, _) => 1,
            (StageKind::Presentation | StageKind::DiscardSink, PortDirection::Input) => 1,
            (StageKind::Presentation | StageKind::DiscardSink, PortDirection::Output) => 0,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Source => "source",
            StageKind::Splitter => "splitter",
            StageKind::Processor => "processor",
            StageKind::Presentation => "presentation",
            StageKind::DiscardSink => "discard sink",
        };
        f.write_str(name)
    }
}

/// Direction of a port on its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortDirection {
    Control,
    Input,
    Output,
}

/// Which source output feeds the fan-out.
///
/// Capture mode still needs frames flowing on the preview port for exposure and white
/// balance to converge, so the preview port then drains into a discard sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SourcePort {
    #[default]
    Preview,
    Capture,
}

impl SourcePort {
    /// Index of the matching source output port.
    pub const fn output_index(self) -> usize {
        match self {
            SourcePort::Preview => 0,
            SourcePort::Capture => 2,
        }
    }
}

/// How buffers move across a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionMode {
    /// Stages exchange buffers directly; the core never sees them.
    Tunnelled,
    /// The core owns the pool and moves every buffer itself.
    Managed,
}

/// Buffer count and size a port asks for once its format is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequirements {
    pub buffer_num: usize,
    pub buffer_size: usize,
}

/// Destination rectangle on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Where and how a presentation stage shows its frames.
///
/// # Example
/// ```rust
/// use prism_capture::prelude::*;
///
/// let region = DisplayRegion::fullscreen(5);
/// assert!(region.fullscreen);
/// assert_eq!(region.layer, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DisplayRegion {
    pub fullscreen: bool,
    pub dest: Rect,
    pub layer: i32,
}

impl DisplayRegion {
    /// Fullscreen output on `layer`.
    pub fn fullscreen(layer: i32) -> Self {
        Self {
            fullscreen: true,
            dest: Rect::default(),
            layer,
        }
    }

    /// Windowed output at `dest` on `layer`.
    pub fn windowed(dest: Rect, layer: i32) -> Self {
        Self {
            fullscreen: false,
            dest,
            layer,
        }
    }
}

/// Errors reported by a stage platform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("no such source {0}")]
    NoSuchSource(usize),
    #[error("unknown stage {0:?}")]
    UnknownStage(StageId),
    #[error("{kind} has no {direction:?} port {index}")]
    NoSuchPort {
        kind: StageKind,
        direction: PortDirection,
        index: usize,
    },
    #[error("unknown port {0:?}")]
    UnknownPort(PortId),
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),
    #[error("format {format} rejected: {reason}")]
    FormatRejected { format: PortFormat, reason: String },
    #[error("port {0:?} is not enabled")]
    PortDisabled(PortId),
    #[error("port {0:?} is already enabled")]
    PortAlreadyEnabled(PortId),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("out of resources: {0}")]
    OutOfResources(String),
}

/// A buffer the platform refused, handed back with the reason.
#[derive(Debug, thiserror::Error)]
#[error("sending buffer failed: {error}")]
pub struct SendError {
    #[source]
    pub error: PlatformError,
    pub buffer: BufferHeader,
}

/// Completion handler registered on a port; called from the platform's completion thread.
pub type CompletionCallback = Arc<dyn Fn(PortId, BufferHeader) + Send + Sync>;

/// Stage platform the pipeline core drives.
///
/// Implementations wrap the hardware media layer (or simulate it, see
/// [`virtual_backend::VirtualPlatform`]). Every call is synchronous; completions arrive
/// asynchronously through the callbacks registered with [`Platform::enable_port`].
pub trait Platform: Send + Sync {
    /// Number of sources attached to the device.
    fn source_count(&self) -> Result<usize, PlatformError>;

    /// Largest frame `source` can produce.
    fn max_resolution(&self, source: usize) -> Result<Resolution, PlatformError>;

    /// Size of the display the presentation stages draw on.
    fn screen_size(&self) -> Result<Resolution, PlatformError>;

    fn create_stage(&self, kind: StageKind) -> Result<StageId, PlatformError>;

    /// Look up a port of `stage`.
    fn port(
        &self,
        stage: StageId,
        direction: PortDirection,
        index: usize,
    ) -> Result<PortId, PlatformError>;

    /// Bind a source stage to a physical camera.
    fn select_source(&self, stage: StageId, source: usize) -> Result<(), PlatformError>;

    /// Commit `format` on `port` and return what its buffers must look like.
    fn commit_format(
        &self,
        port: PortId,
        format: &PortFormat,
    ) -> Result<PortRequirements, PlatformError>;

    fn set_zero_copy(&self, port: PortId, enabled: bool) -> Result<(), PlatformError>;

    fn set_display_region(&self, port: PortId, region: &DisplayRegion)
    -> Result<(), PlatformError>;

    fn enable_stage(&self, stage: StageId) -> Result<(), PlatformError>;

    /// Enable `port`; every buffer it completes is passed to `callback`.
    fn enable_port(&self, port: PortId, callback: CompletionCallback) -> Result<(), PlatformError>;

    /// Disable `port`, dropping its callback and any buffers still queued on it.
    fn disable_port(&self, port: PortId) -> Result<(), PlatformError>;

    fn create_connection(
        &self,
        output: PortId,
        input: PortId,
        mode: ConnectionMode,
    ) -> Result<ConnectionId, PlatformError>;

    fn enable_connection(&self, connection: ConnectionId) -> Result<(), PlatformError>;

    fn disable_connection(&self, connection: ConnectionId) -> Result<(), PlatformError>;

    /// Hand `buffer` to `port`: an output fills it, an input consumes it.
    fn send_buffer(&self, port: PortId, buffer: BufferHeader) -> Result<(), SendError>;

    /// One-shot capture on a source capture port.
    fn trigger_capture(&self, port: PortId) -> Result<(), PlatformError>;

    fn destroy_stage(&self, stage: StageId) -> Result<(), PlatformError>;
}

pub mod virtual_backend;

pub mod prelude {
    pub use crate::{
        CompletionCallback, ConnectionId, ConnectionMode, DisplayRegion, Platform, PlatformError,
        PortDirection, PortId, PortRequirements, Rect, SPLITTER_OUTPUTS, SendError, SourcePort,
        StageId, StageKind,
        virtual_backend::{
            DisplayedFrame, FailPoint, PlatformEvent, PortInfo, VirtualPlatform,
            VirtualPlatformBuilder,
        },
    };
    pub use prism_core::prelude::*;
}
