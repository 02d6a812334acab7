use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written into every checkpoint document. The major
/// component is checked before deserialization; a mismatch fails loudly.
pub const CHECKPOINT_SCHEMA_VERSION: &str = "1.0";

/// Flags controlling a single run.
///
/// Immutable once a run starts, except where [`ModeOverrides`] passed to
/// `resume` explicitly replace individual flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMode {
    /// Pause for user confirmation at checkpoint-boundary stages.
    #[serde(default)]
    pub interactive: bool,
    /// Forward partial output chunks to the progress sink.
    #[serde(default)]
    pub streaming: bool,
    /// Persist a checkpoint after every stage transition.
    #[serde(default)]
    pub resumable: bool,
    /// Skip interactive prompts programmatically.
    #[serde(default)]
    pub auto_confirm: bool,
}

impl ExecutionMode {
    /// A resumable, non-interactive mode. The common default for
    /// unattended runs.
    pub fn resumable() -> Self {
        Self {
            resumable: true,
            ..Self::default()
        }
    }

    /// Enable interactive pauses at checkpoint boundaries.
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Enable streaming of partial output to the progress sink.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Skip interactive prompts even when `interactive` is set.
    pub fn with_auto_confirm(mut self, auto_confirm: bool) -> Self {
        self.auto_confirm = auto_confirm;
        self
    }
}

/// Optional per-flag overrides applied on `resume`. Flags left `None`
/// keep the value stored in the checkpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModeOverrides {
    /// Override the stored `interactive` flag.
    pub interactive: Option<bool>,
    /// Override the stored `streaming` flag.
    pub streaming: Option<bool>,
    /// Override the stored `auto_confirm` flag.
    pub auto_confirm: Option<bool>,
}

impl ModeOverrides {
    /// Apply these overrides on top of a stored mode.
    pub fn apply(&self, mut mode: ExecutionMode) -> ExecutionMode {
        if let Some(interactive) = self.interactive {
            mode.interactive = interactive;
        }
        if let Some(streaming) = self.streaming {
            mode.streaming = streaming;
        }
        if let Some(auto_confirm) = self.auto_confirm {
            mode.auto_confirm = auto_confirm;
        }
        mode
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Created, not yet attempted.
    Queued,
    /// Execution callback in flight.
    Running,
    /// Terminal: finished successfully.
    Completed,
    /// Paused at a durable save point awaiting a user decision.
    Checkpoint,
    /// Terminal: failed after exhausting retries.
    Error,
    /// Terminal: never attempted because an earlier stage failed or the
    /// run was aborted.
    Skipped,
}

/// Error details recorded on a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    /// Short error message.
    pub message: String,
    /// Optional longer diagnostic detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result recorded for a stage after its final attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The textual output produced by the execution callback.
    pub output: String,
    /// Paths or identifiers of artifacts produced by the stage.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Wall-clock duration of the final attempt, in milliseconds.
    pub duration_ms: u64,
    /// Tokens consumed, when the provider reports usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    /// ISO-8601 timestamp of when the result was recorded.
    pub timestamp: DateTime<Utc>,
    /// Retries consumed before this result.
    pub retries: u32,
    /// Error details when the stage ended in [`StageStatus::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

/// One stage's record within a run. Created once from the agent's stage
/// template and mutated in place as execution proceeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    /// Stage name from the template.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Zero-based position in the run's stage list.
    pub index: usize,
    /// Current status.
    pub status: StageStatus,
    /// Retries consumed so far.
    pub retries: u32,
    /// Whether this stage boundary is a durable save point.
    pub checkpoint: bool,
    /// Result of the final attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StageResult>,
}

impl StageState {
    /// Creates a queued stage at the given index.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        index: usize,
        checkpoint: bool,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            index,
            status: StageStatus::Queued,
            retries: 0,
            checkpoint,
            result: None,
        }
    }

    /// Whether this stage is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            StageStatus::Completed | StageStatus::Error | StageStatus::Skipped
        )
    }
}

/// Output returned by the execution callback for one stage attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    /// The agent's textual output, which may contain delegation markers.
    pub output: String,
    /// Artifacts produced during the attempt.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Tokens consumed, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    /// Key/value entries to merge into the run's shared data.
    #[serde(default)]
    pub shared_data: BTreeMap<String, serde_json::Value>,
}

impl StageOutput {
    /// Creates an output carrying only text.
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }
}

/// Derived status of a persisted run, computed from stage states rather
/// than stored redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// At least one stage has not yet reached a terminal or paused state.
    InProgress,
    /// At least one stage is paused at a checkpoint awaiting a decision.
    Paused,
    /// All stages completed.
    Completed,
    /// At least one stage is in error.
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::InProgress => write!(f, "in-progress"),
            RunState::Paused => write!(f, "paused"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// The full persisted state of a run, sufficient to resume execution from
/// the next incomplete stage after a process restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Document schema version, checked before deserialization.
    pub schema_version: String,
    /// SHA-256 over the serialized document with this field blanked.
    pub checksum: String,
    /// Unique run identifier.
    pub run_id: String,
    /// The agent this run executes.
    pub agent: String,
    /// The task text the run was started with.
    pub task: String,
    /// Mode flags the run was started with.
    pub mode: ExecutionMode,
    /// Ordered stage records.
    pub stages: Vec<StageState>,
    /// Index of the last fully completed stage, `-1` if none.
    pub last_completed_stage_index: i64,
    /// Accumulated outputs of completed stages, in stage-index order.
    /// Strictly append-only.
    pub previous_outputs: Vec<String>,
    /// Open key/value map for cross-stage data. `BTreeMap` keeps the
    /// serialized form deterministic so the checksum is stable.
    #[serde(default)]
    pub shared_data: BTreeMap<String, serde_json::Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp; refreshed on every save.
    pub updated_at: DateTime<Utc>,
}

impl CheckpointData {
    /// Creates a fresh checkpoint for a run that has not executed any
    /// stage yet.
    pub fn new(
        run_id: impl Into<String>,
        agent: impl Into<String>,
        task: impl Into<String>,
        mode: ExecutionMode,
        stages: Vec<StageState>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION.to_string(),
            checksum: String::new(),
            run_id: run_id.into(),
            agent: agent.into(),
            task: task.into(),
            mode,
            stages,
            last_completed_stage_index: -1,
            previous_outputs: Vec::new(),
            shared_data: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Index of the first stage that has not fully completed.
    pub fn first_incomplete_index(&self) -> usize {
        (self.last_completed_stage_index + 1) as usize
    }

    /// Number of stages in [`StageStatus::Completed`].
    pub fn completed_stage_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count()
    }

    /// Derives the run status from stage states: failed beats paused,
    /// paused beats completed, anything else is in-progress.
    pub fn derived_state(&self) -> RunState {
        if self
            .stages
            .iter()
            .any(|s| s.status == StageStatus::Error)
        {
            RunState::Failed
        } else if self
            .stages
            .iter()
            .any(|s| s.status == StageStatus::Checkpoint)
        {
            RunState::Paused
        } else if !self.stages.is_empty()
            && self
                .stages
                .iter()
                .all(|s| s.status == StageStatus::Completed)
        {
            RunState::Completed
        } else {
            RunState::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_checkpoint() -> CheckpointData {
        CheckpointData::new(
            "run-1",
            "researcher",
            "Summarize the findings",
            ExecutionMode::resumable(),
            vec![
                StageState::new("plan", "Plan the work", 0, false),
                StageState::new("execute", "Do the work", 1, true),
            ],
            Utc::now(),
        )
    }

    #[test]
    fn test_mode_overrides_apply() {
        let stored = ExecutionMode::resumable().with_interactive(true);
        let overrides = ModeOverrides {
            interactive: Some(false),
            streaming: None,
            auto_confirm: Some(true),
        };
        let merged = overrides.apply(stored);
        assert!(!merged.interactive);
        assert!(merged.auto_confirm);
        assert!(merged.resumable);
        assert!(!merged.streaming);
    }

    #[test]
    fn test_fresh_checkpoint_indices() {
        let data = sample_checkpoint();
        assert_eq!(data.last_completed_stage_index, -1);
        assert_eq!(data.first_incomplete_index(), 0);
        assert_eq!(data.completed_stage_count(), 0);
        assert_eq!(data.derived_state(), RunState::InProgress);
    }

    #[test]
    fn test_derived_state_precedence() {
        let mut data = sample_checkpoint();
        data.stages[0].status = StageStatus::Completed;
        data.stages[1].status = StageStatus::Checkpoint;
        assert_eq!(data.derived_state(), RunState::Paused);

        data.stages[1].status = StageStatus::Error;
        assert_eq!(data.derived_state(), RunState::Failed);

        data.stages[1].status = StageStatus::Completed;
        assert_eq!(data.derived_state(), RunState::Completed);
    }

    #[test]
    fn test_stage_terminal_states() {
        let mut stage = StageState::new("execute", "Do the work", 0, false);
        assert!(!stage.is_terminal());
        stage.status = StageStatus::Checkpoint;
        assert!(!stage.is_terminal());
        stage.status = StageStatus::Skipped;
        assert!(stage.is_terminal());
    }

    #[test]
    fn test_stage_status_serialization() {
        let json = serde_json::to_string(&StageStatus::Checkpoint).unwrap();
        assert_eq!(json, "\"checkpoint\"");
        let parsed: StageStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(parsed, StageStatus::Skipped);
    }

    #[test]
    fn test_checkpoint_serialization_round_trip() {
        let mut data = sample_checkpoint();
        data.shared_data
            .insert("branch".to_string(), serde_json::json!("main"));
        let json = serde_json::to_string(&data).unwrap();
        let parsed: CheckpointData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, data);
    }
}
