//! Diagnostics for the water usage agent.
//!
//! Conditions that are recovered locally (dropped readings, discarded noise,
//! classifier fallbacks) never reach the caller; they are counted here so
//! they stay observable.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, DiagnosticsLog, DiagnosticsStats,
    SharedDiagnosticsLog,
};
