//! Preset execution and scheduling for Cadence.
//!
//! This crate owns the step graph, the execution engine and the scheduler
//! loop, plus the "ports" (repository and handler traits) that
//! `cadence-infra` implements. It never depends on the infra crate or on a
//! database driver.

pub mod credential;
pub mod engine;
pub mod expression;
pub mod handler;
pub mod preset;
pub mod recorder;
pub mod repository;
pub mod schedule;

#[cfg(test)]
mod testing;
