//! Core traits for Devbox.
//!
//! - `store`: collaborators the sandbox engine reads workspace content from

pub mod store;

pub use store::*;
