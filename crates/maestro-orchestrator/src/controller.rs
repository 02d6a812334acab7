use crate::config::ControllerConfig;
use crate::delegation::{DelegationParser, DelegationRequest};
use crate::graph::DependencyGraph;
use crate::profiles::{AgentProfile, ProfileResolver};
use async_trait::async_trait;
use chrono::Utc;
use maestro_checkpoint::CheckpointManager;
use maestro_core::{
    AutoDecision, CheckpointData, ExecutionMode, MaestroError, MaestroResult, ModeOverrides,
    NullSink, ProgressEvent, ProgressEventKind, ProgressSink, PromptChannel, PromptDecision,
    PromptRequest, StageError, StageOutput, StageResult, StageStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A cooperative stop signal for a run.
///
/// The controller checks it between stages and at retry boundaries, the
/// next safe points; an in-flight execution callback is never torn down
/// mid-stage, and cancellation never marks stages as errored.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation at the next safe point.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything the execution callback receives for one stage attempt.
#[derive(Debug)]
pub struct StageContext {
    /// The run this attempt belongs to.
    pub run_id: String,
    /// The agent being executed.
    pub agent: String,
    /// The task the run was started with.
    pub task: String,
    /// Name of the stage being attempted.
    pub stage_name: String,
    /// Zero-based stage index.
    pub stage_index: usize,
    /// Outputs of previously completed stages, in stage-index order.
    pub previous_outputs: Vec<String>,
    /// Cross-stage shared data accumulated so far.
    pub shared_data: BTreeMap<String, serde_json::Value>,
    /// Present in streaming mode: partial output chunks sent here are
    /// forwarded to the progress sink in order.
    pub progress: Option<mpsc::Sender<String>>,
}

/// The execution callback: an external collaborator that executes one
/// stage of an agent's task and returns its output, or fails with a
/// retryable or fatal classification (see [`MaestroError::is_retryable`]).
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Execute one stage attempt.
    async fn execute(&self, ctx: StageContext) -> MaestroResult<StageOutput>;
}

/// Per-call options for `run` and `resume`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit run id; a UUID is generated when absent.
    pub run_id: Option<String>,
    /// Runtime stage-timeout override. Beats every configured level.
    pub stage_timeout_secs: Option<u64>,
    /// Cooperative stop signal shared with the caller.
    pub cancel: Option<CancelToken>,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// All stages completed.
    Completed,
    /// The run stopped at a safe point on a cancel signal or an abort
    /// decision. Resumable.
    Cancelled,
}

/// Final report of a run that completed or was cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// The run identifier.
    pub run_id: String,
    /// The agent that was executed.
    pub agent: String,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Final stage records.
    pub stages: Vec<maestro_core::StageState>,
    /// Accumulated outputs, including labeled delegation results.
    pub previous_outputs: Vec<String>,
}

impl RunReport {
    /// The last accumulated output, if any.
    pub fn final_output(&self) -> Option<&str> {
        self.previous_outputs.last().map(String::as_str)
    }
}

/// The top-level state machine: executes an agent's task as a sequence of
/// retryable, checkpointable stages, recursing into delegated sub-tasks.
///
/// A single run's stages are strictly sequential; parallelism exists only
/// across independent runs, scheduled by [`StageController::run_graph`]
/// from dependency-graph levels.
pub struct StageController {
    profiles: Arc<dyn ProfileResolver>,
    executor: Arc<dyn StageExecutor>,
    checkpoints: Arc<CheckpointManager>,
    sink: Arc<dyn ProgressSink>,
    prompts: Arc<dyn PromptChannel>,
    parser: DelegationParser,
    config: ControllerConfig,
}

impl StageController {
    /// Creates a controller. Fails fast on invalid configuration.
    pub fn new(
        profiles: Arc<dyn ProfileResolver>,
        executor: Arc<dyn StageExecutor>,
        checkpoints: Arc<CheckpointManager>,
        config: ControllerConfig,
    ) -> MaestroResult<Self> {
        config.validate()?;
        Ok(Self {
            profiles,
            executor,
            checkpoints,
            sink: Arc::new(NullSink),
            prompts: Arc::new(AutoDecision(PromptDecision::Continue)),
            parser: DelegationParser::new(),
            config,
        })
    }

    /// Replaces the progress sink.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the interactive prompt channel.
    pub fn with_prompt_channel(mut self, prompts: Arc<dyn PromptChannel>) -> Self {
        self.prompts = prompts;
        self
    }

    /// The checkpoint store this controller persists through.
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Executes an agent's task from the first stage.
    pub async fn run(
        &self,
        agent: &str,
        task: &str,
        mode: ExecutionMode,
        options: RunOptions,
    ) -> MaestroResult<RunReport> {
        let chain = vec![agent.to_string()];
        self.run_delegated(agent, task, mode, options, chain).await
    }

    /// Reloads a checkpoint and continues from the first incomplete stage,
    /// preserving previous outputs and shared data. `overrides` win over
    /// the stored mode.
    pub async fn resume(
        &self,
        run_id: &str,
        overrides: ModeOverrides,
        options: RunOptions,
    ) -> MaestroResult<RunReport> {
        let mut data = self.checkpoints.load(run_id).await?;
        data.mode = overrides.apply(data.mode);
        let profile = self.profiles.resolve(&data.agent)?;

        let start = data.first_incomplete_index();
        for stage in &mut data.stages {
            // A run resumed past a pause point no longer waits on it.
            if stage.index < start && stage.status == StageStatus::Checkpoint {
                stage.status = StageStatus::Completed;
            }
            // Errored and skipped stages after the resume point are
            // re-queued with a fresh retry budget.
            if stage.index >= start && stage.status != StageStatus::Queued {
                stage.status = StageStatus::Queued;
                stage.retries = 0;
            }
        }

        info!(run_id, start_stage = start, agent = %data.agent, "resuming run");
        let chain = vec![data.agent.clone()];
        let outcome = self
            .execute_stages(&mut data, &profile, start, &options, &chain)
            .await?;
        Ok(report(&data, outcome))
    }

    /// Builds the dependency graph over the given profiles, rejects
    /// cycles, and runs each level as a batch of concurrent independent
    /// runs bounded by `max_concurrent_agents`. A level only starts once
    /// the previous level finished.
    pub async fn run_graph(
        self: Arc<Self>,
        profiles: &[AgentProfile],
        task: &str,
        mode: ExecutionMode,
    ) -> MaestroResult<Vec<RunReport>> {
        let graph = DependencyGraph::build(profiles);
        graph.detect_cycles()?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_agents));
        let mut reports = Vec::new();
        for (level, agents) in graph.levels() {
            info!(level, agents = agents.len(), "scheduling graph level");
            let mut handles = Vec::new();
            for agent in agents {
                let controller = Arc::clone(&self);
                let semaphore = Arc::clone(&semaphore);
                let agent = agent.clone();
                let task = task.to_string();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|e| {
                        MaestroError::Orchestrator(format!("scheduler closed: {e}"))
                    })?;
                    controller.run(&agent, &task, mode, RunOptions::default()).await
                }));
            }
            let mut level_results = Vec::new();
            for handle in handles {
                level_results.push(handle.await.map_err(|e| {
                    MaestroError::Orchestrator(format!("agent run panicked: {e}"))
                })?);
            }
            for result in level_results {
                reports.push(result?);
            }
        }
        Ok(reports)
    }

    /// Recursion point shared by `run` and delegation sub-runs. Boxed so
    /// delegated sub-tasks can recurse without an infinitely sized future.
    fn run_delegated<'a>(
        &'a self,
        agent: &'a str,
        task: &'a str,
        mode: ExecutionMode,
        options: RunOptions,
        chain: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = MaestroResult<RunReport>> + Send + 'a>> {
        Box::pin(async move {
            let profile = self.profiles.resolve(agent)?;
            let run_id = options
                .run_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut data = CheckpointData::new(
                run_id.clone(),
                agent,
                task,
                mode,
                profile.stage_states(),
                Utc::now(),
            );
            if mode.resumable {
                self.checkpoints.save(&mut data).await?;
            }
            info!(run_id = %run_id, agent, stages = data.stages.len(), "starting run");
            let outcome = self
                .execute_stages(&mut data, &profile, 0, &options, &chain)
                .await?;
            Ok(report(&data, outcome))
        })
    }

    async fn execute_stages(
        &self,
        data: &mut CheckpointData,
        profile: &AgentProfile,
        start: usize,
        options: &RunOptions,
        chain: &[String],
    ) -> MaestroResult<RunOutcome> {
        let cancel = options.cancel.clone().unwrap_or_default();
        let total = data.stages.len();

        for index in start..total {
            if cancel.is_cancelled() {
                info!(run_id = %data.run_id, stage = index, "run cancelled at stage boundary");
                self.persist(data).await?;
                return Ok(RunOutcome::Cancelled);
            }

            self.emit(data, index, ProgressEventKind::StageStart);
            let stage_timeout = self
                .config
                .resolve_stage_timeout(options.stage_timeout_secs, profile);

            let (mut output, duration_ms) = loop {
                data.stages[index].status = StageStatus::Running;

                let (progress, forwarder) = self.spawn_stream_forwarder(data, index);
                let ctx = StageContext {
                    run_id: data.run_id.clone(),
                    agent: data.agent.clone(),
                    task: data.task.clone(),
                    stage_name: data.stages[index].name.clone(),
                    stage_index: index,
                    previous_outputs: data.previous_outputs.clone(),
                    shared_data: data.shared_data.clone(),
                    progress,
                };

                let started = Instant::now();
                let attempt =
                    match tokio::time::timeout(stage_timeout, self.executor.execute(ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(MaestroError::StageTimeout {
                            stage: data.stages[index].name.clone(),
                            seconds: stage_timeout.as_secs(),
                        }),
                    };
                let elapsed_ms = started.elapsed().as_millis() as u64;
                // Flush streamed chunks before any completion event so
                // per-run ordering holds.
                if let Some(handle) = forwarder {
                    let _ = handle.await;
                }

                match attempt {
                    Ok(output) => break (output, elapsed_ms),
                    Err(e)
                        if e.is_retryable()
                            && data.stages[index].retries < profile.retry.max_retries
                            && !cancel.is_cancelled() =>
                    {
                        data.stages[index].retries += 1;
                        let retries = data.stages[index].retries;
                        warn!(
                            run_id = %data.run_id,
                            stage = index,
                            retries,
                            error = %e,
                            "stage attempt failed, retrying"
                        );
                        tokio::time::sleep(backoff_delay(profile.retry.backoff_base_ms, retries))
                            .await;
                    }
                    // A retryable failure under cancellation halts the run
                    // instead of consuming the retry budget. The stage goes
                    // back to the queue so the run stays resumable.
                    Err(e) if e.is_retryable() && cancel.is_cancelled() => {
                        info!(
                            run_id = %data.run_id,
                            stage = index,
                            error = %e,
                            "run cancelled at retry boundary"
                        );
                        data.stages[index].status = StageStatus::Queued;
                        self.persist(data).await?;
                        return Ok(RunOutcome::Cancelled);
                    }
                    Err(e) => return self.fail_stage(data, index, elapsed_ms, e, chain).await,
                }
            };

            let retries = data.stages[index].retries;
            data.stages[index].status = StageStatus::Completed;
            data.stages[index].result = Some(StageResult {
                output: output.output.clone(),
                artifacts: output.artifacts.clone(),
                duration_ms,
                tokens_used: output.tokens_used,
                timestamp: Utc::now(),
                retries,
                error: None,
            });
            data.previous_outputs.push(output.output.clone());
            for (key, value) in std::mem::take(&mut output.shared_data) {
                data.shared_data.insert(key, value);
            }
            data.last_completed_stage_index = index as i64;
            self.persist(data).await?;
            if data.stages[index].checkpoint && data.mode.resumable {
                self.emit(data, index, ProgressEventKind::Checkpoint);
            }
            self.emit(data, index, ProgressEventKind::StageComplete);
            info!(run_id = %data.run_id, stage = index, name = %data.stages[index].name, "stage completed");

            let requests = self.parser.parse(&output.output, &data.agent);
            if !requests.is_empty() {
                for request in requests {
                    if let Err(e) =
                        check_delegation(&request, chain, profile.max_delegation_depth)
                    {
                        return self.halt_run(data, index, e, chain).await;
                    }
                    // Sub-runs never pause interactively; the parent run
                    // owns the prompt channel.
                    let sub_mode = ExecutionMode {
                        interactive: false,
                        auto_confirm: true,
                        ..data.mode
                    };
                    let mut sub_chain = chain.to_vec();
                    sub_chain.push(request.target_agent.clone());
                    let sub_options = RunOptions {
                        run_id: None,
                        stage_timeout_secs: options.stage_timeout_secs,
                        cancel: Some(cancel.clone()),
                    };
                    info!(
                        run_id = %data.run_id,
                        target = %request.target_agent,
                        depth = sub_chain.len() - 1,
                        "delegating sub-task"
                    );
                    let sub_report = match self
                        .run_delegated(
                            &request.target_agent,
                            &request.task,
                            sub_mode,
                            sub_options,
                            sub_chain,
                        )
                        .await
                    {
                        Ok(sub_report) => sub_report,
                        Err(e) => return self.halt_run(data, index, e, chain).await,
                    };
                    data.previous_outputs.push(format!(
                        "[delegation:{}] {}",
                        request.target_agent,
                        sub_report.final_output().unwrap_or_default()
                    ));
                }
                self.persist(data).await?;
            }

            if data.stages[index].checkpoint
                && data.mode.interactive
                && !data.mode.auto_confirm
                && index + 1 < total
            {
                let decision = self.await_decision(data, index, profile).await?;
                if decision == PromptDecision::Abort {
                    info!(run_id = %data.run_id, stage = index, "run aborted at checkpoint boundary");
                    return Ok(RunOutcome::Cancelled);
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Pauses the run at a checkpoint boundary until a decision arrives or
    /// the user-decision timeout applies the configured default.
    async fn await_decision(
        &self,
        data: &mut CheckpointData,
        index: usize,
        profile: &AgentProfile,
    ) -> MaestroResult<PromptDecision> {
        data.stages[index].status = StageStatus::Checkpoint;
        self.persist(data).await?;

        let message = format!(
            "Stage '{}' reached its checkpoint. Continue with the next stage?",
            data.stages[index].name
        );
        self.emit(data, index, ProgressEventKind::UserPrompt(message.clone()));
        let request = PromptRequest {
            run_id: data.run_id.clone(),
            stage_index: index,
            stage_name: data.stages[index].name.clone(),
            message,
        };

        let timeout = self.config.resolve_user_decision_timeout(profile);
        let decision = match tokio::time::timeout(timeout, self.prompts.request_decision(request))
            .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(run_id = %data.run_id, error = %e, "prompt channel failed, applying default decision");
                self.config.default_decision
            }
            Err(_) => {
                warn!(run_id = %data.run_id, "user decision timed out, applying default decision");
                self.config.default_decision
            }
        };

        data.stages[index].status = StageStatus::Completed;
        self.persist(data).await?;
        Ok(decision)
    }

    /// Marks the stage as terminally errored, skips the remainder, flushes
    /// the checkpoint, and propagates the error with run context.
    async fn fail_stage(
        &self,
        data: &mut CheckpointData,
        index: usize,
        duration_ms: u64,
        err: MaestroError,
        chain: &[String],
    ) -> MaestroResult<RunOutcome> {
        let retries = data.stages[index].retries;
        data.stages[index].status = StageStatus::Error;
        data.stages[index].result = Some(StageResult {
            output: String::new(),
            artifacts: Vec::new(),
            duration_ms,
            tokens_used: None,
            timestamp: Utc::now(),
            retries,
            error: Some(StageError {
                message: err.to_string(),
                detail: None,
            }),
        });
        skip_remaining(data, index + 1);
        self.persist(data).await?;
        self.emit(data, index, ProgressEventKind::StageError(err.to_string()));
        error!(
            run_id = %data.run_id,
            stage = index,
            chain = %chain.join(" -> "),
            error = %err,
            "stage failed after exhausting retries"
        );
        Err(err)
    }

    /// Halts the run on a structural error raised after the current stage
    /// completed (delegation bound violations, failed sub-runs). The
    /// completed stage keeps its result; the remainder is skipped.
    async fn halt_run(
        &self,
        data: &mut CheckpointData,
        index: usize,
        err: MaestroError,
        chain: &[String],
    ) -> MaestroResult<RunOutcome> {
        skip_remaining(data, index + 1);
        self.persist(data).await?;
        self.emit(data, index, ProgressEventKind::StageError(err.to_string()));
        error!(
            run_id = %data.run_id,
            stage = index,
            chain = %chain.join(" -> "),
            error = %err,
            "run halted"
        );
        Err(err)
    }

    async fn persist(&self, data: &mut CheckpointData) -> MaestroResult<()> {
        if data.mode.resumable {
            self.checkpoints.save(data).await?;
        }
        Ok(())
    }

    fn emit(&self, data: &CheckpointData, index: usize, kind: ProgressEventKind) {
        let name = data.stages.get(index).map_or("", |s| s.name.as_str());
        self.sink
            .emit(ProgressEvent::new(data.run_id.as_str(), index, name, kind));
    }

    /// In streaming mode, bridges executor chunks to the sink as
    /// stage-progress events, preserving order.
    fn spawn_stream_forwarder(
        &self,
        data: &CheckpointData,
        index: usize,
    ) -> (Option<mpsc::Sender<String>>, Option<JoinHandle<()>>) {
        if !data.mode.streaming {
            return (None, None);
        }
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let sink = Arc::clone(&self.sink);
        let run_id = data.run_id.clone();
        let stage_name = data.stages[index].name.clone();
        let handle = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                sink.emit(ProgressEvent::new(
                    run_id.as_str(),
                    index,
                    stage_name.as_str(),
                    ProgressEventKind::StageProgress(chunk),
                ));
            }
        });
        (Some(tx), Some(handle))
    }
}

fn report(data: &CheckpointData, outcome: RunOutcome) -> RunReport {
    RunReport {
        run_id: data.run_id.clone(),
        agent: data.agent.clone(),
        outcome,
        stages: data.stages.clone(),
        previous_outputs: data.previous_outputs.clone(),
    }
}

fn skip_remaining(data: &mut CheckpointData, from: usize) {
    for stage in data.stages.iter_mut().skip(from) {
        if stage.status == StageStatus::Queued {
            stage.status = StageStatus::Skipped;
        }
    }
}

/// Rejects a delegation that would re-enter the chain or exceed the depth
/// bound. Both violations are structural: fatal, never retried, because
/// unbounded delegation is indistinguishable from a cycle.
fn check_delegation(
    request: &DelegationRequest,
    chain: &[String],
    max_depth: u32,
) -> MaestroResult<()> {
    if chain.iter().any(|agent| agent == &request.target_agent) {
        return Err(MaestroError::DelegationCycle {
            agent: request.target_agent.clone(),
            chain: chain.join(" -> "),
        });
    }
    let depth = chain.len() as u32;
    if depth > max_depth {
        return Err(MaestroError::DelegationDepth {
            depth,
            max: max_depth,
            chain: format!("{} -> {}", chain.join(" -> "), request.target_agent),
        });
    }
    Ok(())
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped to avoid shifting
/// past 64 bits.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
}
