//! Prompt types for interactive (human-in-the-loop) pauses.
//!
//! These types live in `maestro-core` so that the controller and any
//! front-end (CLI prompt, WebSocket handler, chat bot) can share them
//! without circular dependencies.

use crate::MaestroResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A request for a user decision at a checkpoint boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    /// The run asking for a decision.
    pub run_id: String,
    /// Index of the stage that just reached its checkpoint boundary.
    pub stage_index: usize,
    /// Name of that stage.
    pub stage_name: String,
    /// Human-readable prompt text.
    pub message: String,
}

/// The decision made in response to a [`PromptRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptDecision {
    /// Proceed to the next stage.
    Continue,
    /// Stop the run at this safe point (not a failure).
    Abort,
}

/// Channel through which prompt requests are sent and decisions received.
/// Implementations can be CLI prompts, WebSocket handlers, chat bots, etc.
#[async_trait]
pub trait PromptChannel: Send + Sync {
    /// Present the request and wait for a decision. The controller applies
    /// its own user-decision timeout around this call.
    async fn request_decision(&self, request: PromptRequest) -> MaestroResult<PromptDecision>;
}

/// A channel that always returns a fixed decision. Useful for unattended
/// runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoDecision(pub PromptDecision);

#[async_trait]
impl PromptChannel for AutoDecision {
    async fn request_decision(&self, _request: PromptRequest) -> MaestroResult<PromptDecision> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_decision() {
        let channel = AutoDecision(PromptDecision::Continue);
        let decision = channel
            .request_decision(PromptRequest {
                run_id: "run-1".to_string(),
                stage_index: 0,
                stage_name: "plan".to_string(),
                message: "Continue?".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(decision, PromptDecision::Continue);
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_string(&PromptDecision::Abort).unwrap();
        assert_eq!(json, "\"abort\"");
    }
}
