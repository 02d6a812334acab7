use crate::profiles::{AgentProfile, TimeoutSettings};
use maestro_core::{MaestroError, MaestroResult, PromptDecision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Built-in fallback when no stage timeout is configured anywhere.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 300;
/// Built-in fallback for the user-decision timeout at interactive pauses.
pub const DEFAULT_USER_DECISION_TIMEOUT_SECS: u64 = 60;

fn default_max_concurrent_agents() -> usize {
    4
}

fn default_decision() -> PromptDecision {
    PromptDecision::Continue
}

/// Global configuration for the stage execution controller.
///
/// Validated once at construction; invalid values never surface at run
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Global per-stage timeout, in seconds. `None` falls back to the
    /// built-in default.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
    /// Global user-decision timeout for interactive pauses, in seconds.
    #[serde(default)]
    pub user_decision_timeout_secs: Option<u64>,
    /// Action applied when the user-decision timeout elapses without an
    /// answer.
    #[serde(default = "default_decision")]
    pub default_decision: PromptDecision,
    /// Bound on concurrent agent runs scheduled from graph levels.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// Team-level timeout overrides, keyed by team name.
    #[serde(default)]
    pub team_timeouts: BTreeMap<String, TimeoutSettings>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: None,
            user_decision_timeout_secs: None,
            default_decision: default_decision(),
            max_concurrent_agents: default_max_concurrent_agents(),
            team_timeouts: BTreeMap::new(),
        }
    }
}

impl ControllerConfig {
    /// Fails fast on invalid values.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.stage_timeout_secs == Some(0) {
            return Err(MaestroError::Config(
                "stage timeout must be at least 1 second".to_string(),
            ));
        }
        if self.user_decision_timeout_secs == Some(0) {
            return Err(MaestroError::Config(
                "user-decision timeout must be at least 1 second".to_string(),
            ));
        }
        if self.max_concurrent_agents == 0 {
            return Err(MaestroError::Config(
                "max concurrent agents must be at least 1".to_string(),
            ));
        }
        for (team, timeouts) in &self.team_timeouts {
            if timeouts.stage_timeout_secs == Some(0)
                || timeouts.user_decision_timeout_secs == Some(0)
            {
                return Err(MaestroError::Config(format!(
                    "team '{team}' has a zero timeout"
                )));
            }
        }
        Ok(())
    }

    fn team_timeouts_for(&self, profile: &AgentProfile) -> TimeoutSettings {
        profile
            .team
            .as_ref()
            .and_then(|team| self.team_timeouts.get(team))
            .copied()
            .unwrap_or_default()
    }

    /// Resolves the effective stage timeout. The most specific configured
    /// value wins: runtime override > agent > team > global > built-in.
    pub fn resolve_stage_timeout(
        &self,
        runtime_override_secs: Option<u64>,
        profile: &AgentProfile,
    ) -> Duration {
        let secs = runtime_override_secs
            .or(profile.timeouts.stage_timeout_secs)
            .or(self.team_timeouts_for(profile).stage_timeout_secs)
            .or(self.stage_timeout_secs)
            .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    /// Resolves the effective user-decision timeout: agent > team >
    /// global > built-in.
    pub fn resolve_user_decision_timeout(&self, profile: &AgentProfile) -> Duration {
        let secs = profile
            .timeouts
            .user_decision_timeout_secs
            .or(self.team_timeouts_for(profile).user_decision_timeout_secs)
            .or(self.user_decision_timeout_secs)
            .unwrap_or(DEFAULT_USER_DECISION_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = ControllerConfig {
            stage_timeout_secs: Some(0),
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MaestroError::Config(_))
        ));

        let config = ControllerConfig {
            max_concurrent_agents: 0,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stage_timeout_priority_chain() {
        let mut config = ControllerConfig {
            stage_timeout_secs: Some(100),
            ..ControllerConfig::default()
        };
        config.team_timeouts.insert(
            "analysis".to_string(),
            TimeoutSettings {
                stage_timeout_secs: Some(200),
                user_decision_timeout_secs: None,
            },
        );

        let mut profile = AgentProfile::new("researcher").with_team("analysis");

        // Team beats global.
        assert_eq!(
            config.resolve_stage_timeout(None, &profile),
            Duration::from_secs(200)
        );

        // Agent beats team.
        profile.timeouts.stage_timeout_secs = Some(300);
        assert_eq!(
            config.resolve_stage_timeout(None, &profile),
            Duration::from_secs(300)
        );

        // Runtime override beats everything.
        assert_eq!(
            config.resolve_stage_timeout(Some(5), &profile),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_stage_timeout_falls_back_to_builtin() {
        let config = ControllerConfig::default();
        let profile = AgentProfile::new("worker");
        assert_eq!(
            config.resolve_stage_timeout(None, &profile),
            Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS)
        );
        assert_eq!(
            config.resolve_user_decision_timeout(&profile),
            Duration::from_secs(DEFAULT_USER_DECISION_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_global_beats_builtin() {
        let config = ControllerConfig {
            stage_timeout_secs: Some(42),
            ..ControllerConfig::default()
        };
        let profile = AgentProfile::new("worker");
        assert_eq!(
            config.resolve_stage_timeout(None, &profile),
            Duration::from_secs(42)
        );
    }
}
