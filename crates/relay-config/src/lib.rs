//! # Relay Config
//!
//! Configuration management for Relay.
//! Supports layered configuration from files, environment variables,
//! and runtime refresh.

mod app_config;
mod loader;
pub mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::{format_validation_errors, ConfigValidationError, ConfigValidator};
