//! Evochora logging facade.
//!
//! This crate is a thin wrapper of the crate `log`, so that all Evochora
//! crates share one logger implementation chosen by the binary.

pub use log::{self, debug, error, info, log_enabled, trace, warn, Level};

/// Checks if the trace level is enabled.
pub fn trace_enabled() -> bool {
    log_enabled!(Level::Trace)
}
