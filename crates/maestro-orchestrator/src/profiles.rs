use maestro_core::{MaestroError, MaestroResult, StageState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

fn default_max_delegation_depth() -> u32 {
    3
}

/// One entry of an agent's stage template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    /// Stage name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Whether this stage boundary is a durable save point.
    #[serde(default)]
    pub checkpoint: bool,
}

impl StageTemplate {
    /// Creates a non-checkpoint stage.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            checkpoint: false,
        }
    }

    /// Marks this stage boundary as a durable save point.
    pub fn with_checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }
}

/// Timeouts configured at agent or team level. `None` falls through to the
/// next level of the resolution chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Per-stage execution timeout, in seconds.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
    /// How long to wait for a user decision at an interactive pause.
    #[serde(default)]
    pub user_decision_timeout_secs: Option<u64>,
}

/// Retry policy applied to transient stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries per stage before the failure becomes terminal.
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
        }
    }
}

/// Definition of an agent: its stages, declared dependencies on other
/// agents, and execution policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique agent name.
    pub name: String,
    /// Optional team this agent belongs to, for team-level timeouts.
    #[serde(default)]
    pub team: Option<String>,
    /// Names of agents this one depends on in the static graph.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Ordered stage template; an empty template yields a single
    /// `execute` stage.
    #[serde(default)]
    pub stages: Vec<StageTemplate>,
    /// Bound on recursive delegation spawned by this agent's output.
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,
    /// Agent-level timeout overrides.
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Retry policy for transient stage failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl AgentProfile {
    /// Creates a profile with default policies and an empty stage template.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            team: None,
            dependencies: Vec::new(),
            stages: Vec::new(),
            max_delegation_depth: default_max_delegation_depth(),
            timeouts: TimeoutSettings::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the stage template.
    pub fn with_stages(mut self, stages: Vec<StageTemplate>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the declared dependencies.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the team.
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Sets the delegation depth bound.
    pub fn with_max_delegation_depth(mut self, depth: u32) -> Self {
        self.max_delegation_depth = depth;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Materializes the stage template into fresh per-run stage records.
    pub fn stage_states(&self) -> Vec<StageState> {
        if self.stages.is_empty() {
            return vec![StageState::new("execute", "Execute the task", 0, false)];
        }
        self.stages
            .iter()
            .enumerate()
            .map(|(index, template)| {
                StageState::new(
                    template.name.clone(),
                    template.description.clone(),
                    index,
                    template.checkpoint,
                )
            })
            .collect()
    }

    fn validate(&self) -> MaestroResult<()> {
        if self.name.trim().is_empty() {
            return Err(MaestroError::Config(
                "agent profile is missing a name".to_string(),
            ));
        }
        if self.timeouts.stage_timeout_secs == Some(0) {
            return Err(MaestroError::Config(format!(
                "agent '{}' has a zero stage timeout",
                self.name
            )));
        }
        if self.timeouts.user_decision_timeout_secs == Some(0) {
            return Err(MaestroError::Config(format!(
                "agent '{}' has a zero user-decision timeout",
                self.name
            )));
        }
        Ok(())
    }
}

/// Resolves agent names to profiles. The controller fails with
/// [`MaestroError::AgentNotFound`] when a name cannot be resolved.
pub trait ProfileResolver: Send + Sync {
    /// Resolve an agent name to its profile.
    fn resolve(&self, name: &str) -> MaestroResult<AgentProfile>;
}

/// An in-memory profile resolver backed by a fixed set of profiles.
#[derive(Debug)]
pub struct StaticProfileResolver {
    profiles: HashMap<String, AgentProfile>,
}

impl StaticProfileResolver {
    /// Builds a resolver, validating every profile up front so invalid
    /// configuration never surfaces at run time. Duplicate names keep the
    /// last definition, with a warning.
    pub fn from_profiles(profiles: Vec<AgentProfile>) -> MaestroResult<Self> {
        let mut map = HashMap::new();
        for profile in profiles {
            profile.validate()?;
            if map.contains_key(&profile.name) {
                warn!(agent = %profile.name, "duplicate agent profile, last definition wins");
            }
            map.insert(profile.name.clone(), profile);
        }
        Ok(Self { profiles: map })
    }

    /// All registered profiles, in arbitrary order.
    pub fn profiles(&self) -> Vec<&AgentProfile> {
        self.profiles.values().collect()
    }
}

impl ProfileResolver for StaticProfileResolver {
    fn resolve(&self, name: &str) -> MaestroResult<AgentProfile> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| MaestroError::AgentNotFound(name.to_string()))
    }
}
