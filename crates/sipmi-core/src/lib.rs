//! Shared plumbing for the sipmi crates: tracing setup and fd readiness.

#[cfg(unix)]
pub mod io;
pub mod tracing;

#[cfg(unix)]
pub use io::wait_readable;
pub use tracing::{init_tracing, TracingConfig, TracingError, TracingOutputFormat};
