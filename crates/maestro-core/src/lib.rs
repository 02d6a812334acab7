//! Core types and error definitions for the Maestro orchestration engine.
//!
//! This crate provides the foundational types shared across all Maestro
//! crates: the unified error enum, run/stage state records, the persisted
//! checkpoint document, progress events, and the interactive prompt channel.
//!
//! # Main types
//!
//! - [`MaestroError`] — Unified error enum for all Maestro subsystems.
//! - [`MaestroResult`] — Convenience alias for `Result<T, MaestroError>`.
//! - [`ExecutionMode`] — Flags controlling a single run (interactive, streaming, ...).
//! - [`StageState`] — One stage's mutable execution record.
//! - [`CheckpointData`] — The full persisted run state document.
//! - [`ProgressSink`] — Fire-and-forget lifecycle event consumer.
//! - [`PromptChannel`] — Human-in-the-loop decision collaborator.

/// Injectable clock abstraction for deterministic time in tests.
pub mod clock;
/// Unified error enum and result alias.
pub mod error;
/// Progress events and the fire-and-forget sink.
pub mod events;
/// Interactive prompt (human-in-the-loop) types.
pub mod prompt;
/// Run, stage, and checkpoint state records.
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{MaestroError, MaestroResult};
pub use events::{ChannelSink, NullSink, ProgressEvent, ProgressEventKind, ProgressSink};
pub use prompt::{AutoDecision, PromptChannel, PromptDecision, PromptRequest};
pub use types::{
    CheckpointData, ExecutionMode, ModeOverrides, RunState, StageError, StageOutput, StageResult,
    StageState, StageStatus, CHECKPOINT_SCHEMA_VERSION,
};
