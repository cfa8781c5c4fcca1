//! Process-wide tracing setup for herald binaries.

/// Initialize tracing for the process. Safe to call more than once.
pub fn init() {
    self::tracing::init();
}

pub mod tracing;

pub use self::tracing::{LogFormat, init_with};
