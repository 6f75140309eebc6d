//! # Relay Core
//!
//! Process-level error type and logging setup shared by every Relay crate.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_tracing, LoggingConfig, LogFormat};
