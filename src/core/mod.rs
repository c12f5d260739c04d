//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Component wiring and lifecycle
//! - [`time`] - Wall-clock utilities
//! - [`error`] - Error types and status mapping

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
