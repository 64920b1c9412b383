//! Shared domain types for Cadence.
//!
//! Presets and their steps, scheduled tasks, run records and the repository
//! error type. Zero infrastructure dependencies -- only serde, uuid, chrono,
//! thiserror and schemars.

pub mod config;
pub mod error;
pub mod preset;
pub mod run;
pub mod task;
