pub mod colors;
mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;
pub mod retry;

pub use error::Error;

/// Field manager name used for every server-side-apply patch this agent
/// issues.
pub const MANAGER_NAME: &str = "node-termination-handler";

/// How many times the same poll() error string may repeat in a row before
/// the monitor supervisor panics to force a restart.
pub const DUPLICATE_ERROR_THRESHOLD: usize = 3;

/// Dispatcher tick rate.
pub const DISPATCH_TICK: std::time::Duration = std::time::Duration::from_secs(1);
