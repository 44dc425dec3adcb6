//! Core types, traits, and error definitions for Devbox.
//!
//! This crate provides the building blocks shared by the sandbox engine and
//! the process entry point: the error taxonomy, layered configuration,
//! telemetry setup, and the collaborator traits the engine is injected with.

pub mod config;
pub mod error;
pub mod fs_policy;
pub mod fs_store;
pub mod mocks;
pub mod telemetry;
pub mod traits;

pub use crate::config::{AppConfig, BackendKind, SandboxConfig, TelemetryConfig};
pub use error::{Error, Result};
pub use fs_store::DirectoryFileStore;
pub use traits::*;
