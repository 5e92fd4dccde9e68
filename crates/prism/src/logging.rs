//! Log output for demos and tools built on prism.
//!
//! The library itself only emits `tracing` events; installing a subscriber is left to
//! the application. [`init`] is the one the bundled demos use.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::pipeline_api::set_verbose;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `info` for prism.
///
/// With `verbose` set, per-frame events are emitted and prism logs at `debug`.
/// Returns `false` when a global subscriber was already installed.
pub fn init(verbose: bool) -> bool {
    set_verbose(verbose);
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    for target in ["prism", "prism_capture", "prism_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
