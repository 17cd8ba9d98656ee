//! Resumable stage pipeline.
//!
//! Pipeline flow:
//! topic + inputs → [skip checkpointed stages] → executor → sanitize →
//! checkpoint → next stage ... → final stage output
//!
//! Each attempt starts from the top of the sequence. Stages that already have
//! a checkpoint for the topic are skipped and their stored output becomes the
//! next stage's context, so a retry after a rate limit only re-executes the
//! stage that was in flight and the ones after it.

use crate::checkpoint::{Checkpoint, CheckpointStore, ProgressView};
use crate::executor::{Credentials, StageExecutor, StageRequest};
use crate::models::{CrewError, Result, StageId, StageSequence};
use crate::pipeline::{CancelToken, RetryDecision, RetryPolicy};
use crate::sanitize::sanitize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Input key under which the topic is always available to executors.
pub const TOPIC_INPUT: &str = "topic";

/// One logical pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Sole cache/resume key
    pub topic: String,
    /// Caller inputs handed to every stage
    pub inputs: HashMap<String, String>,
    /// Clear the topic's checkpoints before the first attempt
    pub force_restart: bool,
    pub credentials: Credentials,
}

impl PipelineRun {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            inputs: HashMap::new(),
            force_restart: false,
            credentials: Credentials::default(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, String>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn force_restart(mut self, force: bool) -> Self {
        self.force_restart = force;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Inputs with the topic filled in unless the caller set it explicitly.
    fn stage_inputs(&self) -> HashMap<String, String> {
        let mut inputs = self.inputs.clone();
        inputs
            .entry(TOPIC_INPUT.to_string())
            .or_insert_with(|| self.topic.clone());
        inputs
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    /// Final stage's sanitized output
    pub output: String,
    /// Stages the executor ran in this attempt
    pub executed: Vec<StageId>,
    /// Stages served from checkpoints in this attempt
    pub skipped: Vec<StageId>,
    /// Every stage was already checkpointed
    pub cache_hit: bool,
}

/// Result of a full run, retries included.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub output: String,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Stages executed by the successful attempt
    pub executed: Vec<StageId>,
    /// Stages the successful attempt resumed past
    pub skipped: Vec<StageId>,
    pub cache_hit: bool,
}

/// Orchestrates the stage sequence against a checkpoint store.
pub struct PipelineRunner<E> {
    store: Arc<CheckpointStore>,
    stages: StageSequence,
    executor: E,
    retry: RetryPolicy,
}

impl<E: StageExecutor> PipelineRunner<E> {
    /// Create a runner with the default retry policy.
    pub fn new(store: Arc<CheckpointStore>, stages: StageSequence, executor: E) -> Self {
        Self {
            store,
            stages,
            executor,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn stages(&self) -> &StageSequence {
        &self.stages
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Read-only progress handle, safe to poll while a run is in flight.
    pub fn progress(&self) -> ProgressView {
        ProgressView::new(Arc::clone(&self.store), self.stages.clone())
    }

    /// Run the pipeline for `topic` and return the final stage's output.
    pub async fn run(
        &self,
        topic: &str,
        inputs: HashMap<String, String>,
        force_restart: bool,
        credentials: Credentials,
    ) -> Result<String> {
        let run = PipelineRun::new(topic)
            .with_inputs(inputs)
            .force_restart(force_restart)
            .with_credentials(credentials);
        let outcome = self.execute(&run, &CancelToken::new()).await?;
        Ok(outcome.output)
    }

    /// Run with retry on rate limits.
    ///
    /// `force_restart` only applies to the first attempt; later attempts
    /// resume from whatever the earlier ones checkpointed.
    pub async fn execute(&self, run: &PipelineRun, cancel: &CancelToken) -> Result<RunOutcome> {
        let start = Instant::now();
        info!(
            topic = %run.topic,
            force_restart = run.force_restart,
            stages = self.stages.len(),
            max_attempts = self.retry.max_attempts,
            "Starting pipeline run"
        );

        let result = self
            .retry
            .retry(cancel, RetryDecision::on_rate_limit, move |attempt| async move {
                let force_restart = run.force_restart && attempt == 1;
                let report = self.run_once(run, cancel, force_restart).await?;
                Ok::<_, CrewError>((attempt, report))
            })
            .await;

        match result {
            Ok((attempts, report)) => {
                info!(
                    topic = %run.topic,
                    attempts,
                    executed = report.executed.len(),
                    skipped = report.skipped.len(),
                    cache_hit = report.cache_hit,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Pipeline run complete"
                );
                Ok(RunOutcome {
                    output: report.output,
                    attempts,
                    executed: report.executed,
                    skipped: report.skipped,
                    cache_hit: report.cache_hit,
                })
            }
            Err(error) => {
                warn!(
                    topic = %run.topic,
                    error = %error,
                    preserved = ?self.completed_stage_names(&run.topic),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Pipeline run failed"
                );
                Err(error)
            }
        }
    }

    /// One pass over the stage sequence, without retry.
    ///
    /// Any executor error stops the pass at the failing stage. Checkpoints
    /// written before it stay in the store, so calling again without
    /// `force_restart` resumes at the first stage that has none.
    pub async fn run_once(
        &self,
        run: &PipelineRun,
        cancel: &CancelToken,
        force_restart: bool,
    ) -> Result<AttemptReport> {
        let topic = run.topic.as_str();
        if topic.trim().is_empty() {
            return Err(CrewError::InvalidInput("topic must not be empty".to_string()));
        }

        self.store.set_active_topic(topic);
        if force_restart {
            let removed = self.store.clear(topic);
            info!(topic = %topic, removed, "Force restart, starting fresh");
        }

        if let Some(report) = self.cached_report(topic) {
            info!(topic = %topic, "All stages already completed, returning checkpointed output");
            return Ok(report);
        }

        let inputs = run.stage_inputs();
        let mut executed = Vec::new();
        let mut skipped = Vec::new();
        let mut context: Option<Arc<Checkpoint>> = None;

        for (index, stage) in self.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(topic = %topic, stage = %stage, "Run cancelled at stage boundary");
                return Err(CrewError::Cancelled {
                    stage: Some(stage.clone()),
                });
            }

            if let Some(checkpoint) = self.store.get(topic, stage).filter(|cp| cp.done) {
                debug!(topic = %topic, stage = %stage, "Stage checkpointed, skipping");
                skipped.push(stage.clone());
                context = Some(checkpoint);
                continue;
            }

            info!(topic = %topic, stage = %stage, index, "Running stage");
            let stage_start = Instant::now();
            let request = StageRequest {
                topic,
                stage,
                index,
                inputs: &inputs,
                context: context.as_deref().map(|cp| cp.output.as_str()),
                credentials: &run.credentials,
            };

            let output = match self.executor.execute(request).await {
                Ok(output) => output,
                Err(source) => {
                    let preserved = self.completed_stage_names(topic);
                    if source.is_rate_limited() {
                        warn!(topic = %topic, stage = %stage, error = %source, ?preserved, "Stage rate limited");
                    } else {
                        warn!(topic = %topic, stage = %stage, error = %source, ?preserved, "Stage failed");
                    }
                    return Err(CrewError::stage(stage.clone(), source));
                }
            };

            let checkpoint = self.store.save(
                topic,
                stage,
                sanitize(&output.text),
                output.producer_label,
            );
            info!(
                topic = %topic,
                stage = %stage,
                producer = %checkpoint.producer_label,
                elapsed_ms = stage_start.elapsed().as_millis() as u64,
                "Stage completed and checkpointed"
            );
            executed.push(stage.clone());
            context = Some(checkpoint);
        }

        let output = context
            .map(|cp| cp.output.clone())
            .ok_or_else(|| CrewError::Internal("stage sequence produced no output".to_string()))?;

        Ok(AttemptReport {
            output,
            executed,
            skipped,
            cache_hit: false,
        })
    }

    /// Fast path: every stage checkpointed, return the last one's output.
    fn cached_report(&self, topic: &str) -> Option<AttemptReport> {
        if !self.store.is_complete(topic, &self.stages) {
            return None;
        }
        // A concurrent clear between the two reads just means a normal pass.
        let last = self.store.get(topic, self.stages.last())?;
        Some(AttemptReport {
            output: last.output.clone(),
            executed: Vec::new(),
            skipped: self.stages.iter().cloned().collect(),
            cache_hit: true,
        })
    }

    fn completed_stage_names(&self, topic: &str) -> Vec<String> {
        self.store
            .checkpoints(topic, &self.stages)
            .iter()
            .map(|cp| cp.stage.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ProgressObserver;
    use crate::executor::testing::ScriptedExecutor;
    use crate::models::StageError;
    use std::time::Duration;

    type Runner = PipelineRunner<Arc<ScriptedExecutor>>;

    fn runner_with(executor: ScriptedExecutor) -> (Runner, Arc<ScriptedExecutor>) {
        let executor = Arc::new(executor);
        let runner = PipelineRunner::new(
            Arc::new(CheckpointStore::new()),
            StageSequence::plan_write_edit(),
            Arc::clone(&executor),
        );
        (runner, executor)
    }

    fn runner() -> (Runner, Arc<ScriptedExecutor>) {
        runner_with(ScriptedExecutor::new())
    }

    fn seed(store: &CheckpointStore, topic: &str, stages: &[&str]) {
        for stage in stages {
            store.save(topic, &StageId::from(*stage), format!("cached {stage}"), "seed");
        }
    }

    async fn run(runner: &Runner, topic: &str, force_restart: bool) -> Result<RunOutcome> {
        let run = PipelineRun::new(topic).force_restart(force_restart);
        runner.execute(&run, &CancelToken::new()).await
    }

    #[tokio::test]
    async fn test_full_run_threads_sanitized_context() {
        let (runner, executor) = runner();
        let outcome = run(&runner, "rust", false).await.unwrap();

        assert_eq!(outcome.output, "edit(write(plan(rust)))");
        assert_eq!(executor.calls(), vec!["plan", "write", "edit"]);
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.cache_hit);

        let plan = runner.store().get("rust", &"plan".into()).unwrap();
        assert_eq!(plan.output, "plan(rust)");
        assert_eq!(plan.producer_label, "plan-bot");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_executor() {
        let (runner, executor) = runner();
        seed(runner.store(), "T", &["plan", "write", "edit"]);

        let outcome = run(&runner, "T", false).await.unwrap();

        assert_eq!(outcome.output, "cached edit");
        assert!(outcome.cache_hit);
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_runs_only_missing_stages() {
        let (runner, executor) = runner();
        seed(runner.store(), "T", &["plan"]);

        let outcome = run(&runner, "T", false).await.unwrap();

        assert_eq!(executor.calls(), vec!["write", "edit"]);
        assert_eq!(outcome.output, "edit(write(cached plan))");
        assert_eq!(outcome.skipped, vec![StageId::from("plan")]);
        assert_eq!(
            outcome.executed,
            vec![StageId::from("write"), StageId::from("edit")]
        );
        assert_eq!(runner.store().get("T", &"plan".into()).unwrap().producer_label, "seed");
    }

    #[tokio::test]
    async fn test_force_restart_clears_only_target_topic() {
        let (runner, executor) = runner();
        seed(runner.store(), "A", &["plan", "write", "edit"]);
        seed(runner.store(), "B", &["plan", "write", "edit"]);
        let before: Vec<Arc<Checkpoint>> = runner.store().checkpoints("B", runner.stages());

        let outcome = run(&runner, "A", true).await.unwrap();

        assert_eq!(executor.calls(), vec!["plan", "write", "edit"]);
        assert_eq!(outcome.output, "edit(write(plan(A)))");
        let after = runner.store().checkpoints("B", runner.stages());
        assert_eq!(before.len(), 3);
        assert!(before.iter().zip(&after).all(|(b, a)| Arc::ptr_eq(b, a)));
    }

    #[tokio::test]
    async fn test_force_restart_on_unknown_topic_is_noop() {
        let (runner, executor) = runner();
        let outcome = run(&runner, "fresh", true).await.unwrap();
        assert_eq!(outcome.output, "edit(write(plan(fresh)))");
        assert_eq!(executor.call_count(), 3);
    }

    #[tokio::test]
    async fn test_checkpoints_follow_stage_order() {
        let (runner, _executor) = runner();
        run(&runner, "ordered", false).await.unwrap();

        let store = runner.store();
        let stages = runner.stages();
        for (k, stage) in stages.iter().enumerate() {
            if store.has("ordered", stage) {
                assert!(stages.iter().take(k).all(|earlier| store.has("ordered", earlier)));
            }
        }
        let first = store.get("ordered", &"plan".into()).unwrap();
        let last = store.get("ordered", &"edit".into()).unwrap();
        assert!(first.completed_at <= last.completed_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retry_resumes_cheaply() {
        let (runner, executor) = runner();
        executor.fail_next("write", StageError::rate_limited("429 Too Many Requests"));

        let outcome = run(&runner, "T", false).await.unwrap();

        assert_eq!(outcome.output, "edit(write(plan(T)))");
        assert_eq!(executor.calls_for("plan"), 1);
        assert_eq!(executor.calls_for("write"), 2);
        assert_eq!(executor.calls_for("edit"), 1);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.attempts <= runner.retry_policy().max_attempts);
        assert_eq!(outcome.skipped, vec![StageId::from("plan")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_retry_hint_waits_at_most_max_wait() {
        let (runner, executor) = runner();
        executor.fail_next(
            "write",
            StageError::RateLimited {
                message: "429".to_string(),
                retry_after_secs: Some(1e300),
            },
        );
        let start = tokio::time::Instant::now();

        let output = runner
            .run("T", HashMap::new(), false, Credentials::new())
            .await
            .unwrap();

        assert_eq!(output, "edit(write(plan(T)))");
        assert_eq!(executor.calls_for("write"), 2);
        assert_eq!(start.elapsed(), runner.retry_policy().max_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_restart_not_repeated_on_retry() {
        let (runner, executor) = runner();
        seed(runner.store(), "T", &["plan", "write", "edit"]);
        executor.fail_next("edit", StageError::rate_limited("429"));

        let outcome = run(&runner, "T", true).await.unwrap();

        assert_eq!(executor.calls(), vec!["plan", "write", "edit", "edit"]);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhausts_attempts() {
        let (runner, executor) = runner();
        let runner = runner.with_retry_policy(RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        });
        for _ in 0..10 {
            executor.fail_next("write", StageError::rate_limited("429"));
        }

        let err = run(&runner, "T", false).await.unwrap_err();

        assert!(err.is_rate_limited());
        assert_eq!(err.failed_stage(), Some(&StageId::from("write")));
        assert_eq!(executor.calls_for("plan"), 1);
        assert_eq!(executor.calls_for("write"), 3);
        assert!(runner.store().has("T", &"plan".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_halts_pipeline_and_is_resumable() {
        let (runner, executor) = runner();
        executor.fail_next("write", StageError::failed("model refused"));

        let err = run(&runner, "T", false).await.unwrap_err();

        assert!(!err.is_rate_limited());
        assert!(matches!(
            &err,
            CrewError::Stage { stage, source: StageError::Failed(_) } if stage.as_str() == "write"
        ));
        assert_eq!(executor.calls(), vec!["plan", "write"]);
        assert_eq!(executor.calls_for("edit"), 0);
        assert!(runner.store().has("T", &"plan".into()));
        assert!(!runner.store().has("T", &"write".into()));

        // Resume exactly at the failed stage.
        let outcome = run(&runner, "T", false).await.unwrap();
        assert_eq!(executor.calls(), vec!["plan", "write", "write", "edit"]);
        assert_eq!(outcome.output, "edit(write(plan(T)))");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let (runner, executor) = runner();
        run(&runner, "A", false).await.unwrap();
        run(&runner, "B", false).await.unwrap();

        assert_eq!(executor.call_count(), 6);
        assert_eq!(runner.store().active_topic().as_deref(), Some("B"));
        assert!(runner.store().is_complete("A", runner.stages()));

        // Returning to A is a cache hit.
        let outcome = run(&runner, "A", false).await.unwrap();
        assert!(outcome.cache_hit);
        assert_eq!(outcome.output, "edit(write(plan(A)))");
        assert_eq!(executor.call_count(), 6);
    }

    #[tokio::test]
    async fn test_inputs_and_credentials_reach_executor_contract() {
        let (runner, _executor) = runner();
        let output = runner
            .run(
                "topic-key",
                HashMap::from([("audience".to_string(), "devs".to_string())]),
                false,
                Credentials::new().with("groq", "key"),
            )
            .await
            .unwrap();
        assert_eq!(output, "edit(write(plan(topic-key)))");

        let run = PipelineRun::new("t").with_input("audience", "devs");
        let inputs = run.stage_inputs();
        assert_eq!(inputs.get(TOPIC_INPUT).map(String::as_str), Some("t"));
        assert_eq!(inputs.get("audience").map(String::as_str), Some("devs"));
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let (runner, executor) = runner();
        let err = run(&runner, "  ", false).await.unwrap_err();
        assert!(matches!(err, CrewError::InvalidInput(_)));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (runner, executor) = runner();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = runner
            .execute(&PipelineRun::new("T"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, CrewError::Cancelled { stage: Some(ref s) } if s.as_str() == "plan"));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_observed_at_next_stage_boundary() {
        let (runner, executor) = runner_with(ScriptedExecutor::with_delay(Duration::from_secs(10)));
        let runner = Arc::new(runner);
        let cancel = CancelToken::new();

        let handle = {
            let runner = Arc::clone(&runner);
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.execute(&PipelineRun::new("T"), &cancel).await })
        };

        // plan finishes at t=10s, write is in flight until t=20s.
        tokio::time::sleep(Duration::from_secs(15)).await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();

        assert!(matches!(err, CrewError::Cancelled { stage: Some(ref s) } if s.as_str() == "edit"));
        assert_eq!(executor.calls(), vec!["plan", "write"]);
        assert!(runner.store().has("T", &"write".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_observable_during_run() {
        let (runner, _executor) =
            runner_with(ScriptedExecutor::with_delay(Duration::from_secs(10)));
        let runner = Arc::new(runner);
        let progress = runner.progress();
        assert!(progress.snapshot().topic.is_none());

        let handle = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.execute(&PipelineRun::new("T"), &CancelToken::new()).await })
        };

        tokio::time::sleep(Duration::from_secs(15)).await;
        let mid = progress.snapshot();
        assert_eq!(mid.topic.as_deref(), Some("T"));
        assert_eq!(mid.completed(), 1);
        assert_eq!(mid.next_pending, Some(StageId::from("write")));

        handle.await.unwrap().unwrap();
        let done = progress.snapshot();
        assert!(done.is_complete());
        assert_eq!(done.completed(), 3);
    }
}
