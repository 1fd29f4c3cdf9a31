//! Common types for the lumen activation runtime
//!
//! This crate provides the error types and engine configuration shared by
//! the kernel crate and by the orchestration layer that drives it.

pub mod config;
pub mod error;

pub use config::{BackendKind, ConfigError, EngineConfig};
pub use error::*;
