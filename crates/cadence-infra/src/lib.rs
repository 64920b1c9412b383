//! Infrastructure layer for Cadence.
//!
//! Contains implementations of the ports defined in `cadence-core`: SQLite
//! storage, the built-in step handlers, the file-backed credential resolver,
//! plus the config loader, data-directory layout and daemon process plumbing.

pub mod config;
pub mod credentials;
pub mod daemon;
pub mod filesystem;
pub mod handlers;
pub mod sqlite;
