//! Durable run-state persistence for the Maestro orchestration engine.
//!
//! A run's full state is written as a JSON document under one directory per
//! run id, next to `artifacts/` and `logs/` subdirectories. Documents carry
//! a schema version (checked before deserialization) and a SHA-256 checksum
//! (verified on load; mismatches are treated as corruption and never
//! silently repaired).
//!
//! # Main types
//!
//! - [`CheckpointManager`] — Save, load, list, delete, and age out checkpoints.
//! - [`CheckpointSummary`] — Listing entry with a derived run status.

/// Checkpoint persistence and restore.
pub mod manager;

pub use manager::{CheckpointManager, CheckpointSummary};
