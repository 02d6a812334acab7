//! Stage-based orchestration engine for multi-agent tasks.
//!
//! Implements the four mechanisms at the heart of Maestro: a dependency
//! graph builder that tiers agents for parallel execution, a delegation
//! parser that extracts recursive sub-task requests from agent output, a
//! stage execution controller that runs a task as a sequence of retryable,
//! checkpointable stages, and (via `maestro-checkpoint`) crash-resumable
//! state.
//!
//! # Main types
//!
//! - [`StageController`] — Top-level state machine: `run`, `resume`, `run_graph`.
//! - [`DependencyGraph`] — Tiered dependency graph with cycle detection.
//! - [`DelegationParser`] — Extracts `@agent task` markers from free text.
//! - [`AgentProfile`] — An agent's stages, dependencies, and policies.
//! - [`ControllerConfig`] — Timeout, concurrency, and prompt policy.

/// Controller configuration and timeout resolution.
pub mod config;
/// Stage execution controller.
pub mod controller;
/// Delegation marker parsing.
pub mod delegation;
/// Dependency graph construction, leveling, and cycle detection.
pub mod graph;
/// Agent profiles and profile resolution.
pub mod profiles;

pub use config::ControllerConfig;
pub use controller::{
    CancelToken, RunOptions, RunOutcome, RunReport, StageContext, StageController, StageExecutor,
};
pub use delegation::{DelegationParser, DelegationRequest};
pub use graph::{AgentNode, DependencyGraph, NodeStatus};
pub use profiles::{
    AgentProfile, ProfileResolver, RetryPolicy, StageTemplate, StaticProfileResolver,
    TimeoutSettings,
};
