use crate::error::{HarnessError, Result};
use crate::refine::PromptRefiner;
use crate::state::{unix_now_ms, AttemptOutcome, BenchmarkResult, ModelState};
use crate::store::StateStore;
use crate::timeout::TimeoutPolicy;
use broker_evaluator::{BenchmarkTask, Evaluator, TaskSet};
use broker_provider::{CompletionRequest, ModelDescriptor, ModelProvider};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Sampling temperature for tasks that do not set their own.
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Lifecycle of one (model, task) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Pending,
    Running,
    Passed,
    FailedRetryable,
    FailedTerminal,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::FailedTerminal)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub phase: TaskPhase,
    pub result: BenchmarkResult,
    /// Prompt learned from the critic during this run, if any.
    pub refined_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRun {
    pub model_id: String,
    pub reports: Vec<TaskReport>,
    /// Embedding models are not benchmarked.
    pub skipped: bool,
    /// A stop was requested before every task ran.
    pub stopped: bool,
}

impl ModelRun {
    pub fn results(&self) -> impl Iterator<Item = &BenchmarkResult> {
        self.reports.iter().map(|r| &r.result)
    }
}

/// Drives benchmark tasks against models, one model state at a time.
pub struct BenchmarkHarness {
    provider: Arc<dyn ModelProvider>,
    evaluator: Evaluator,
    store: Arc<dyn StateStore>,
    refiner: PromptRefiner,
    timeouts: TimeoutPolicy,
    concurrency: usize,
}

struct Attempt {
    response: String,
    passed: bool,
    score: f64,
    outcome: AttemptOutcome,
    error: Option<String>,
    provider_timed_out: bool,
    elapsed_ms: u64,
}

impl BenchmarkHarness {
    pub fn new(provider: Arc<dyn ModelProvider>, evaluator: Evaluator, store: Arc<dyn StateStore>) -> Self {
        let refiner = PromptRefiner::new(provider.clone(), None);
        Self {
            provider,
            evaluator,
            store,
            refiner,
            timeouts: TimeoutPolicy::default(),
            concurrency: 1,
        }
    }

    pub fn with_refiner(mut self, refiner: PromptRefiner) -> Self {
        self.refiner = refiner;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Number of models benchmarked at the same time by [`Self::run_models`].
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    /// Run every task of `tasks` against one model, in task-set order.
    pub async fn run_model(&self, descriptor: &ModelDescriptor, tasks: &TaskSet) -> Result<ModelRun> {
        let (_tx, stop) = watch::channel(false);
        self.run_model_until(descriptor, tasks, &stop).await
    }

    /// Like [`Self::run_model`], checking `stop` before each task. Results
    /// already persisted stay persisted when a stop arrives.
    pub async fn run_model_until(
        &self,
        descriptor: &ModelDescriptor,
        tasks: &TaskSet,
        stop: &watch::Receiver<bool>,
    ) -> Result<ModelRun> {
        let mut run = ModelRun {
            model_id: descriptor.id.clone(),
            reports: Vec::with_capacity(tasks.len()),
            skipped: false,
            stopped: false,
        };
        if descriptor.is_embedding_model() {
            log::info!("Skipping embedding model {}", descriptor.id);
            run.skipped = true;
            return Ok(run);
        }

        let mut state = self
            .store
            .load(&descriptor.id)
            .await?
            .unwrap_or_else(|| ModelState::new(descriptor.id.clone(), descriptor.context_window));
        state.context_window = descriptor.context_window;

        log::info!(
            "Benchmarking {} ({} tasks, {} model)",
            descriptor.id,
            tasks.len(),
            descriptor.param_size_hint.as_str()
        );
        for task in tasks {
            if *stop.borrow() {
                log::info!("Stop requested; {} halted before task {}", descriptor.id, task.id);
                run.stopped = true;
                break;
            }
            let report = self.run_task(descriptor, task, &mut state).await?;
            log::info!(
                "{} / {}: {} (score {:.2}, retries {})",
                descriptor.id,
                task.id,
                report.phase,
                report.result.score,
                report.result.retry_count
            );
            run.reports.push(report);
        }
        Ok(run)
    }

    /// One task through `Pending -> Running -> {Passed, FailedRetryable, FailedTerminal}`.
    ///
    /// The task gets at most one retry, shared by transport and grading
    /// failures. Exactly one result is appended to `state` and persisted.
    pub async fn run_task(
        &self,
        descriptor: &ModelDescriptor,
        task: &BenchmarkTask,
        state: &mut ModelState,
    ) -> Result<TaskReport> {
        let mut phase = TaskPhase::Pending;
        log::debug!("{} / {}: {phase}", descriptor.id, task.id);

        let mut prompt = state.strategy_for(&task.id).unwrap_or(task.prompt.as_str()).to_string();
        let mut retry_count = 0u32;
        let mut escalations = 0u32;
        let mut refined_prompt = None;

        let (attempt, bound) = loop {
            phase = TaskPhase::Running;
            let bound = self.timeouts.escalated(descriptor.param_size_hint, escalations);
            log::debug!("{} / {}: {phase} (attempt {}, bound {bound:?})", descriptor.id, task.id, retry_count + 1);

            let attempt = self.attempt(descriptor, task, &prompt, bound).await;
            if attempt.passed {
                phase = TaskPhase::Passed;
                break (attempt, bound);
            }
            if retry_count > 0 {
                phase = TaskPhase::FailedTerminal;
                break (attempt, bound);
            }

            phase = TaskPhase::FailedRetryable;
            log::debug!(
                "{} / {}: {phase} ({})",
                descriptor.id,
                task.id,
                attempt.error.as_deref().unwrap_or("no detail")
            );
            retry_count = 1;
            match attempt.outcome {
                AttemptOutcome::ProviderError if attempt.provider_timed_out => escalations += 1,
                AttemptOutcome::FailedGrading => {
                    if let Some(revised) = self
                        .refiner
                        .refine(task, &prompt, &attempt.response, &descriptor.id)
                        .await
                    {
                        state.learn_prompt(task.id.clone(), revised.clone());
                        self.store.save(state).await?;
                        prompt = revised.clone();
                        refined_prompt = Some(revised);
                    }
                }
                AttemptOutcome::ProviderError | AttemptOutcome::Passed => {}
            }
        };

        let result = BenchmarkResult {
            task_id: task.id.clone(),
            model_id: descriptor.id.clone(),
            passed: attempt.passed,
            score: attempt.score,
            elapsed_ms: attempt.elapsed_ms,
            raw_response: attempt.response,
            used_prompt: prompt,
            retry_count,
            outcome: attempt.outcome,
            error: attempt.error,
            timeout_secs: bound.as_secs(),
            recorded_at_unix_ms: unix_now_ms(),
        };
        state.record(result.clone());
        self.store.save(state).await?;

        Ok(TaskReport {
            phase,
            result,
            refined_prompt,
        })
    }

    async fn attempt(
        &self,
        descriptor: &ModelDescriptor,
        task: &BenchmarkTask,
        prompt: &str,
        bound: std::time::Duration,
    ) -> Attempt {
        let request = CompletionRequest::new(descriptor.id.clone(), prompt, bound)
            .with_system_prompt(task.system_prompt.clone())
            .with_temperature(Some(task.temperature.unwrap_or(DEFAULT_TEMPERATURE)));

        let started = Instant::now();
        let completion = self.provider.complete(&request).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match completion {
            Err(err) => Attempt {
                response: String::new(),
                passed: false,
                score: 0.0,
                outcome: AttemptOutcome::ProviderError,
                provider_timed_out: err.is_timeout(),
                error: Some(err.to_string()),
                elapsed_ms,
            },
            Ok(completion) => {
                let grade = self.evaluator.grade(task, &completion.text).await;
                Attempt {
                    passed: grade.passed,
                    score: grade.score,
                    outcome: if grade.passed {
                        AttemptOutcome::Passed
                    } else {
                        AttemptOutcome::FailedGrading
                    },
                    error: grade.first_error().map(str::to_string),
                    provider_timed_out: false,
                    response: completion.text,
                    elapsed_ms,
                }
            }
        }
    }

    /// Benchmark several models, at most `concurrency` at a time. Results
    /// come back in the order of `models`. A stop prevents models that have
    /// not started yet from starting.
    pub async fn run_models(
        self: &Arc<Self>,
        models: Vec<ModelDescriptor>,
        tasks: Arc<TaskSet>,
        stop: watch::Receiver<bool>,
    ) -> Vec<(String, Result<ModelRun>)> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();

        for (idx, descriptor) in models.into_iter().enumerate() {
            let harness = Arc::clone(self);
            let tasks = Arc::clone(&tasks);
            let permits = Arc::clone(&permits);
            let stop = stop.clone();
            set.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (idx, None),
                };
                if *stop.borrow() {
                    return (idx, None);
                }
                let run = harness.run_model_until(&descriptor, &tasks, &stop).await;
                (idx, Some(run))
            });
        }

        let mut slots: Vec<Option<Result<ModelRun>>> = ids.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Some(run))) => slots[idx] = Some(run),
                Ok((idx, None)) => {
                    slots[idx] = Some(Ok(ModelRun {
                        model_id: ids[idx].clone(),
                        reports: Vec::new(),
                        skipped: false,
                        stopped: true,
                    }))
                }
                Err(err) => log::error!("benchmark task failed to complete: {err}"),
            }
        }

        ids.into_iter()
            .zip(slots)
            .map(|(id, slot)| {
                let run = slot.unwrap_or_else(|| Err(HarnessError::Join(format!("no result for {id}"))));
                (id, run)
            })
            .collect()
    }
}
