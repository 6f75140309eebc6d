//! # Relay Server Library
//!
//! Wiring for the `relay-server` binary: the application builder that
//! assembles driver, workers and scheduler, default processors for the
//! built-in job kinds, and startup output.

pub mod app;
pub mod handlers;
pub mod startup;
