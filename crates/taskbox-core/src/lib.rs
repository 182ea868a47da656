//! # Taskbox Core
//!
//! Shared error definitions and the telemetry bootstrap used by every
//! Taskbox crate.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_telemetry, shutdown_telemetry, LogFormat, TelemetryConfig};
