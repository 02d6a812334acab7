use thiserror::Error;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the Maestro orchestration engine.
///
/// Variants map onto the error taxonomy: configuration errors fail fast at
/// construction, not-found is distinct from corruption, transient execution
/// errors are the only locally retried class, and structural errors (cycles,
/// delegation bounds) are always fatal.
#[derive(Debug, Error)]
pub enum MaestroError {
    /// Invalid configuration value (timeout, retry limit, threshold).
    #[error("Config error: {0}")]
    Config(String),

    /// The named agent could not be resolved to a profile.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No checkpoint exists for the given run id.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// A checkpoint exists but failed checksum or structural verification.
    /// Never silently repaired.
    #[error("Checkpoint for run {run_id} is corrupt: {reason}")]
    CheckpointCorrupt {
        /// The run whose checkpoint failed verification.
        run_id: String,
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The checkpoint document carries an unsupported schema version.
    #[error("Unsupported checkpoint schema version {found} (supported: {supported})")]
    SchemaVersion {
        /// Version string found in the document.
        found: String,
        /// Version string this build understands.
        supported: String,
    },

    /// The static dependency graph contains a cycle. The payload is the
    /// arrow-joined cycle path.
    #[error("Dependency cycle detected: {0}")]
    Cycle(String),

    /// A delegation would exceed the configured maximum delegation depth.
    #[error("Delegation depth {depth} exceeds limit {max} (chain: {chain})")]
    DelegationDepth {
        /// Depth the rejected delegation would have reached.
        depth: u32,
        /// Configured maximum delegation depth.
        max: u32,
        /// Arrow-joined delegation chain up to the rejected request.
        chain: String,
    },

    /// A delegation targets an agent already present in the delegation
    /// chain (direct or indirect re-delegation).
    #[error("Delegation cycle: agent '{agent}' is already in the chain {chain}")]
    DelegationCycle {
        /// The agent that was re-delegated to.
        agent: String,
        /// Arrow-joined delegation chain at the time of the request.
        chain: String,
    },

    /// A stage execution exceeded its resolved timeout. Retryable.
    #[error("Stage '{stage}' timed out after {seconds}s")]
    StageTimeout {
        /// Name of the stage that timed out.
        stage: String,
        /// The timeout that was applied, in seconds.
        seconds: u64,
    },

    /// An error reported by the execution callback, classified as
    /// retryable or fatal by the collaborator that produced it.
    #[error("Execution error: {message}")]
    Execution {
        /// The collaborator's error description.
        message: String,
        /// Whether the controller may retry the stage.
        retryable: bool,
    },

    /// An error from the stage execution controller itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    /// Creates a retryable execution error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a fatal (non-retryable) execution error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the retry policy applies to this error.
    ///
    /// Only transient execution errors and timeouts qualify; structural and
    /// configuration errors can never be fixed by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StageTimeout { .. }
                | Self::Execution {
                    retryable: true,
                    ..
                }
        )
    }
}
