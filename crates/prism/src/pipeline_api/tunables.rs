use std::sync::{
    OnceLock,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use prism_core::prelude::Encoding;

/// Default minimum buffer count of a processor output pool.
pub const DEFAULT_POOL_MIN: usize = 3;
/// Default extra buffers beyond what the port asks for.
pub const DEFAULT_POOL_SPARE: usize = 1;
/// Headers a presenting branch needs beyond the port's own: one on screen, one held.
pub const PRESENTATION_RESERVE: usize = 2;
/// Default encoding between the source, the splitter and the processor inputs.
pub const DEFAULT_UPSTREAM_ENCODING: Encoding = Encoding::RGBA;

/// Tunables for pipeline buffer pools and upstream formats.
///
/// # Example
/// ```rust
/// use prism::prelude::*;
///
/// set_tunables(Tunables {
///     pool_min: 4,
///     pool_spare: 2,
///     upstream_encoding: Encoding::I420,
/// });
/// assert_eq!(tunables().pool_min, 4);
/// set_tunables(Tunables::default());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Tunables {
    pub pool_min: usize,
    pub pool_spare: usize,
    pub upstream_encoding: Encoding,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            pool_min: DEFAULT_POOL_MIN,
            pool_spare: DEFAULT_POOL_SPARE,
            upstream_encoding: DEFAULT_UPSTREAM_ENCODING,
        }
    }
}

impl Tunables {
    pub(crate) fn sanitized(self) -> Self {
        let upstream_encoding = if self.upstream_encoding.is_supported() {
            self.upstream_encoding
        } else {
            DEFAULT_UPSTREAM_ENCODING
        };
        Self {
            pool_min: self.pool_min.max(1),
            pool_spare: self.pool_spare,
            upstream_encoding,
        }
    }

    /// Buffers to allocate for a port that recommends `recommended`.
    ///
    /// A branch feeding a presentation stage always gets room for the frame on screen
    /// and the frame held by the consumer on top of what the port keeps in flight.
    pub fn pool_size(&self, recommended: usize, presenting: bool) -> usize {
        let sized = recommended.max(self.pool_min) + self.pool_spare;
        if presenting {
            sized.max(recommended.max(1) + PRESENTATION_RESERVE)
        } else {
            sized
        }
    }
}

static TUNABLES: OnceLock<Mutex<Tunables>> = OnceLock::new();
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Override pipeline tunables process-wide; affects pipelines built afterwards.
pub fn set_tunables(tunables: Tunables) {
    let lock = TUNABLES.get_or_init(|| Mutex::new(Tunables::default()));
    *lock.lock() = tunables.sanitized();
}

/// Current process-wide tunables.
pub fn tunables() -> Tunables {
    TUNABLES
        .get()
        .map(|t| *t.lock())
        .unwrap_or_default()
}

/// Toggle per-frame diagnostics (capture, retry and render events).
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Builder for process-wide prism settings.
///
/// # Example
/// ```rust
/// use prism::prelude::*;
///
/// PrismConfig::new()
///     .pool(4, 1)
///     .upstream_encoding(Encoding::RGBA)
///     .verbose(false)
///     .apply();
/// ```
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PrismConfig {
    tunables: Tunables,
    verbose: bool,
}

impl PrismConfig {
    /// Start building a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override pool sizing.
    pub fn pool(mut self, min: usize, spare: usize) -> Self {
        self.tunables.pool_min = min;
        self.tunables.pool_spare = spare;
        self
    }

    /// Override the encoding carried from the source to the processors.
    pub fn upstream_encoding(mut self, encoding: Encoding) -> Self {
        self.tunables.upstream_encoding = encoding;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Tunables this configuration would apply.
    pub fn tunables(&self) -> Tunables {
        self.tunables.sanitized()
    }

    /// Apply the configuration process-wide.
    pub fn apply(self) {
        set_tunables(self.tunables);
        set_verbose(self.verbose);
    }
}
