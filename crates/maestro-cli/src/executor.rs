//! Subprocess-based stage execution.
//!
//! Runs a provider CLI (by default `claude -p --output-format json`) once
//! per stage attempt and maps its exit status onto the retry taxonomy: a
//! spawn failure means the binary is missing and retrying cannot help, a
//! non-zero exit is treated as transient.

use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult, StageOutput};
use maestro_orchestrator::{StageContext, StageExecutor};
use serde::Deserialize;
use tracing::info;

fn default_command() -> String {
    "claude".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ]
}

/// Provider CLI settings from the `[executor]` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// The provider binary.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments placed before the prompt.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
        }
    }
}

/// Executes each stage by spawning the configured provider CLI with a
/// prompt assembled from the stage context.
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    /// Creates an executor for the given provider settings.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

fn build_prompt(ctx: &StageContext) -> String {
    let mut prompt = format!(
        "You are agent '{}', working on stage '{}'.\n\nTask:\n{}",
        ctx.agent, ctx.stage_name, ctx.task
    );
    if !ctx.previous_outputs.is_empty() {
        prompt.push_str("\n\nOutputs from earlier stages:\n");
        for (position, output) in ctx.previous_outputs.iter().enumerate() {
            prompt.push_str(&format!("--- output {} ---\n{output}\n", position + 1));
        }
    }
    prompt
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    async fn execute(&self, ctx: StageContext) -> MaestroResult<StageOutput> {
        let prompt = build_prompt(&ctx);

        let mut cmd = tokio::process::Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.arg(&prompt);

        info!(
            run_id = %ctx.run_id,
            stage = %ctx.stage_name,
            prompt_len = prompt.len(),
            "spawning provider CLI"
        );

        let output = cmd.output().await.map_err(|e| MaestroError::Execution {
            message: format!(
                "failed to run '{}'. Is the provider CLI installed? Error: {e}",
                self.config.command
            ),
            retryable: false,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(MaestroError::Execution {
                message: format!(
                    "provider CLI failed (exit {}): {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
                retryable: true,
            });
        }

        // The provider prints a JSON result as its last line; plain-text
        // providers fall back to raw stdout.
        let parsed: Option<serde_json::Value> = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line).ok());

        match parsed {
            Some(value) => {
                if value["is_error"].as_bool().unwrap_or(false) {
                    return Err(MaestroError::Execution {
                        message: format!(
                            "provider reported an error: {}",
                            value["result"].as_str().unwrap_or_default()
                        ),
                        retryable: true,
                    });
                }
                Ok(StageOutput {
                    output: value["result"].as_str().unwrap_or_default().to_string(),
                    tokens_used: value["usage"]["output_tokens"].as_u64(),
                    ..StageOutput::default()
                })
            }
            None => Ok(StageOutput::text(stdout.trim())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_prompt_includes_earlier_outputs() {
        let ctx = StageContext {
            run_id: "run-1".to_string(),
            agent: "researcher".to_string(),
            task: "Summarize the findings".to_string(),
            stage_name: "report".to_string(),
            stage_index: 2,
            previous_outputs: vec!["plan text".to_string(), "raw data".to_string()],
            shared_data: BTreeMap::new(),
            progress: None,
        };
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("agent 'researcher'"));
        assert!(prompt.contains("stage 'report'"));
        assert!(prompt.contains("--- output 1 ---\nplan text"));
        assert!(prompt.contains("--- output 2 ---\nraw data"));
    }

    #[test]
    fn test_default_config_targets_claude() {
        let config = ExecutorConfig::default();
        assert_eq!(config.command, "claude");
        assert!(config.args.contains(&"json".to_string()));
    }
}
