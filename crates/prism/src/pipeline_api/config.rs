use std::fmt;

use prism_capture::prelude::*;
use smallvec::SmallVec;

/// Stable handle of a configured branch: the source it hangs off and its splitter output.
///
/// # Example
/// ```rust
/// use prism::prelude::BranchHandle;
///
/// let handle = BranchHandle::new(0, 2);
/// assert_eq!(handle.index(), 2);
/// assert_eq!(handle.to_string(), "0.2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BranchHandle {
    source: usize,
    index: usize,
}

impl BranchHandle {
    pub const fn new(source: usize, index: usize) -> Self {
        Self { source, index }
    }

    /// Source the branch is fed by.
    pub const fn source(self) -> usize {
        self.source
    }

    /// Splitter output the branch is attached to.
    pub const fn index(self) -> usize {
        self.index
    }
}

impl fmt::Display for BranchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.index)
    }
}

/// Requested output of one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BranchConfig {
    pub width: u32,
    pub height: u32,
    pub encoding: Encoding,
    /// Share buffers with the presentation stage instead of copying.
    pub zero_copy: bool,
    /// Where the branch is shown, if it has a presentation stage.
    pub presentation: Option<DisplayRegion>,
}

impl BranchConfig {
    pub fn resolution(&self) -> Option<Resolution> {
        Resolution::new(self.width, self.height)
    }

    /// Format committed on the processor output (and the presentation input).
    pub fn format(&self) -> Option<PortFormat> {
        self.resolution()
            .map(|res| PortFormat::aligned(self.encoding, res))
    }
}

/// Configuration of one physical camera.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceConfig {
    pub index: usize,
    /// Largest frame the camera can produce, queried once.
    pub max: Resolution,
    pub port: SourcePort,
    pub branches: SmallVec<[BranchConfig; SPLITTER_OUTPUTS]>,
}

impl SourceConfig {
    pub fn new(index: usize, max: Resolution) -> Self {
        Self {
            index,
            max,
            port: SourcePort::default(),
            branches: SmallVec::new(),
        }
    }

    /// A source is only built when at least one branch uses it.
    pub fn in_use(&self) -> bool {
        !self.branches.is_empty()
    }

    /// Capture-port mode keeps the preview port streaming into a discard sink.
    pub fn needs_discard_sink(&self) -> bool {
        self.port == SourcePort::Capture
    }

    /// Largest width and height requested across the branches.
    pub fn provisioned(&self) -> Option<Resolution> {
        let width = self.branches.iter().map(|b| b.width).max()?;
        let height = self.branches.iter().map(|b| b.height).max()?;
        Resolution::new(width, height)
    }
}
