use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::{DebugRecorder, RecordingOptions, RunTracer, TraceEventKind};
use crate::config::ExecutionSettings;
use crate::error::{Error, Result};
use crate::programs::dispatcher::{RunScope, StepDispatcher};
use crate::programs::run::{
    FailureReason, RunContext, RunResult, RunStatus, StepError, StepErrorKind, StepResult,
    StepStatus, TriggerDecision, BRANCH_ALL_PREDECESSORS_SKIPPED, BRANCH_CANCELLED,
    BRANCH_UNREACHABLE, BRANCH_UPSTREAM_FAILED,
};
use crate::programs::types::{ExecutionConfig, ExecutionStrategy, Program, Step};
use crate::programs::validation::{validate_program, StepGraph, ValidationIssue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Skipped,
    Failed { tolerated: bool },
}

enum Readiness {
    Waiting,
    Ready,
    Skip(&'static str, String),
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    enabled: bool,
    max_retries: u32,
    initial_backoff_ms: u64,
    multiplier: f64,
    max_backoff_ms: u64,
}

impl RetryPolicy {
    fn allows(&self, attempt: u32, kind: Option<StepErrorKind>) -> bool {
        self.enabled && attempt <= self.max_retries && kind.is_some_and(StepErrorKind::is_retryable)
    }
}

/// Everything a spawned step task owns.
struct StepJob {
    step: Arc<Step>,
    dispatcher: StepDispatcher,
    scope: RunScope,
    variables: Arc<BTreeMap<String, Value>>,
    policy: RetryPolicy,
    timeout: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

struct StepAttempts {
    result: StepResult,
    superseded: Vec<StepResult>,
}

type TaskOutput = (String, std::result::Result<StepAttempts, String>);

/// Walks a program's step graph and produces its [`RunResult`].
#[derive(Clone)]
pub struct ProgramExecutor {
    dispatcher: StepDispatcher,
    recorder: Arc<DebugRecorder>,
    settings: ExecutionSettings,
}

impl ProgramExecutor {
    pub fn new(
        dispatcher: StepDispatcher,
        recorder: Arc<DebugRecorder>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            dispatcher,
            recorder,
            settings,
        }
    }

    pub fn dispatcher(&self) -> &StepDispatcher {
        &self.dispatcher
    }

    pub fn recorder(&self) -> &Arc<DebugRecorder> {
        &self.recorder
    }

    pub fn validate(&self, program: &Program) -> Vec<ValidationIssue> {
        validate_program(
            program,
            self.dispatcher.registry(),
            self.dispatcher.evaluator(),
        )
    }

    fn concurrency_limit(&self, execution: &ExecutionConfig) -> usize {
        match execution.strategy {
            ExecutionStrategy::Parallel => {
                if execution.parallel_limit > self.settings.parallel_hard_limit {
                    warn!(
                        requested = execution.parallel_limit,
                        hard_limit = self.settings.parallel_hard_limit,
                        "parallel_limit clamped to configured hard limit"
                    );
                }
                execution
                    .parallel_limit
                    .min(self.settings.parallel_hard_limit)
                    .max(1)
            }
            ExecutionStrategy::Sequential | ExecutionStrategy::Conditional => 1,
        }
    }

    fn retry_policy(&self, execution: &ExecutionConfig) -> RetryPolicy {
        RetryPolicy {
            enabled: execution.retry_failed_steps,
            max_retries: execution.max_retries,
            initial_backoff_ms: execution.retry_backoff_ms,
            multiplier: self.settings.retry_backoff_multiplier,
            max_backoff_ms: self
                .settings
                .retry_backoff_max_ms
                .max(execution.retry_backoff_ms),
        }
    }

    /// Executes `program` against `context`. Step-level problems end up in the
    /// returned result; only structural problems are returned as errors.
    pub async fn run(
        &self,
        program: &Program,
        context: RunContext,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        if !program.is_executable() {
            return Err(Error::Validation(format!(
                "program '{}' v{} is archived and cannot be executed",
                program.id, program.version
            )));
        }
        let issues: Vec<ValidationIssue> = self
            .validate(program)
            .into_iter()
            .filter(ValidationIssue::blocks_execution)
            .collect();
        if !issues.is_empty() {
            return Err(Error::InvalidProgram {
                program_id: program.id.clone(),
                issues,
            });
        }

        let run_id = context.run_id.clone();
        let started_at = Utc::now();
        let clock = Instant::now();
        let execution = &program.execution;

        self.recorder.begin_run(
            &run_id,
            &program.id,
            program.version,
            RecordingOptions {
                tracking: program.analytics.enable_tracking,
                debug: program.analytics.store_debug_info || context.debug_mode,
            },
        );
        let tracer = RunTracer::new(self.recorder.clone(), &run_id);
        tracer.run_event(TraceEventKind::RunStarted {
            program_id: program.id.clone(),
            version: program.version,
            strategy: execution.strategy.as_str().to_owned(),
        });

        let limit = self.concurrency_limit(execution);
        let policy = self.retry_policy(execution);
        let deadline = execution
            .run_deadline_seconds
            .map(|seconds| clock + Duration::from_secs(seconds));
        info!(
            run_id = %run_id,
            program_id = %program.id,
            version = program.version,
            strategy = execution.strategy.as_str(),
            limit,
            "run started"
        );

        let graph = StepGraph::build(program);
        let steps: HashMap<&str, Arc<Step>> = program
            .steps
            .iter()
            .map(|step| (step.id.as_str(), Arc::new(step.clone())))
            .collect();
        let reachable = graph.reachable(&graph.entry_points(program));

        let scope = RunScope {
            run_id: run_id.clone(),
            tenant_id: context.tenant_id.clone(),
            user_id: context.user_id.clone(),
            events: Arc::new(context.events().clone()),
            now: context.now(),
            personality: program.personality.clone(),
            tracer: tracer.clone(),
        };
        let run_token = cancel.child_token();
        let mut state = RunState::new(program, tracer.clone(), context, run_token.clone());

        for id in graph.order() {
            if !reachable.contains(id) {
                state.skip(id, BRANCH_UNREACHABLE, "not reachable from any entry point");
            }
        }

        let mut in_flight: JoinSet<TaskOutput> = JoinSet::new();
        loop {
            let mut progressed = false;
            if !run_token.is_cancelled() {
                for id in graph.order() {
                    if state.is_terminal(id) || state.running.contains(id) {
                        continue;
                    }
                    match state.readiness(&graph, id) {
                        Readiness::Waiting => {}
                        Readiness::Skip(branch, reason) => {
                            state.skip(id, branch, reason);
                            progressed = true;
                        }
                        Readiness::Ready => {
                            if in_flight.len() >= limit {
                                continue;
                            }
                            let Some(step) = steps.get(id.as_str()) else {
                                continue;
                            };
                            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                                state.finish(
                                    StepResult::failed(
                                        id,
                                        deadline_error(),
                                        TriggerDecision::unevaluated(),
                                        Utc::now(),
                                    )
                                    .with_attempt(0),
                                );
                                progressed = true;
                                continue;
                            }

                            let timeout = Duration::from_secs(
                                step.timeout_seconds.unwrap_or(execution.timeout_seconds),
                            );
                            let job = StepJob {
                                step: step.clone(),
                                dispatcher: self.dispatcher.clone(),
                                scope: scope.clone(),
                                variables: state.context.snapshot(),
                                policy,
                                timeout,
                                deadline,
                                cancel: run_token.child_token(),
                            };
                            debug!(run_id = %run_id, step_id = %id, "dispatching step");
                            state.running.insert(id.clone());
                            in_flight.spawn(run_step(job));
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                if progressed && !run_token.is_cancelled() {
                    continue;
                }
                break;
            }

            tokio::select! {
                biased;
                _ = run_token.cancelled() => break,
                joined = in_flight.join_next() => {
                    if let Some(joined) = joined {
                        state.absorb(joined);
                    }
                }
            }
        }

        let interrupted =
            run_token.is_cancelled() && graph.order().iter().any(|id| !state.is_terminal(id));
        if interrupted {
            if state.fault.is_none() {
                tracer.run_event(TraceEventKind::RunCancelled);
                info!(run_id = %run_id, "run cancelled");
            }
            while let Some(joined) = in_flight.join_next().await {
                state.absorb(joined);
            }
            let reason = if state.fault.is_some() {
                "run aborted after engine fault"
            } else {
                "run cancelled"
            };
            for id in graph.order() {
                if !state.is_terminal(id) {
                    state.skip(id, BRANCH_CANCELLED, reason);
                }
            }
        }

        let deadline_passed = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        let failure_reason = if let Some(message) = state.fault.clone() {
            Some(FailureReason::EngineFault { message })
        } else if interrupted {
            Some(FailureReason::Cancelled)
        } else {
            state.first_blocking_failure().map(|failed| {
                if deadline_passed && failed.error_kind() == Some(StepErrorKind::Timeout) {
                    FailureReason::DeadlineExceeded
                } else {
                    FailureReason::StepFailed {
                        step_id: failed.step_id.clone(),
                    }
                }
            })
        };
        let status = if failure_reason.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        tracer.run_event(TraceEventKind::RunCompleted {
            status,
            failure_reason: failure_reason.clone(),
            elapsed_ms,
        });
        match &failure_reason {
            None => info!(run_id = %run_id, elapsed_ms, "run completed"),
            Some(reason) => info!(run_id = %run_id, elapsed_ms, %reason, "run failed"),
        }

        let RunState {
            context,
            results,
            retried,
            ..
        } = state;
        Ok(RunResult {
            run_id,
            program_id: program.id.clone(),
            version: program.version,
            status,
            failure_reason,
            steps: results,
            retried,
            variables: context.into_variables(),
            started_at,
            finished_at: Utc::now(),
            elapsed_ms,
        })
    }
}

/// Loop-local bookkeeping. Only the engine loop touches it.
struct RunState {
    tracer: RunTracer,
    context: RunContext,
    tolerant: HashSet<String>,
    outcomes: HashMap<String, Outcome>,
    running: HashSet<String>,
    results: Vec<StepResult>,
    retried: Vec<StepResult>,
    fault: Option<String>,
    run_token: CancellationToken,
}

impl RunState {
    fn new(
        program: &Program,
        tracer: RunTracer,
        context: RunContext,
        run_token: CancellationToken,
    ) -> Self {
        Self {
            tracer,
            context,
            tolerant: program
                .steps
                .iter()
                .filter(|step| step.continue_on_failure)
                .map(|step| step.id.clone())
                .collect(),
            outcomes: HashMap::new(),
            running: HashSet::new(),
            results: Vec::with_capacity(program.steps.len()),
            retried: Vec::new(),
            fault: None,
            run_token,
        }
    }

    fn is_terminal(&self, step_id: &str) -> bool {
        self.outcomes.contains_key(step_id)
    }

    fn readiness(&self, graph: &StepGraph, step_id: &str) -> Readiness {
        let predecessors = graph.predecessors(step_id);
        if predecessors.iter().any(|id| !self.is_terminal(id)) {
            return Readiness::Waiting;
        }
        if let Some(failed) = predecessors
            .iter()
            .find(|id| self.outcomes.get(id.as_str()) == Some(&Outcome::Failed { tolerated: false }))
        {
            return Readiness::Skip(
                BRANCH_UPSTREAM_FAILED,
                format!("predecessor '{failed}' failed"),
            );
        }
        if !predecessors.is_empty()
            && predecessors
                .iter()
                .all(|id| self.outcomes.get(id.as_str()) == Some(&Outcome::Skipped))
        {
            return Readiness::Skip(
                BRANCH_ALL_PREDECESSORS_SKIPPED,
                "every predecessor was skipped".to_owned(),
            );
        }
        Readiness::Ready
    }

    fn skip(&mut self, step_id: &str, branch: &str, reason: impl Into<String>) {
        let result =
            StepResult::skipped(step_id, TriggerDecision::skip(branch, reason), Utc::now())
                .with_attempt(0);
        self.finish(result);
    }

    fn finish(&mut self, result: StepResult) {
        let step_id = result.step_id.clone();
        let branch = result.trigger.branch.clone();
        let (kind, outcome) = match result.status {
            StepStatus::Completed => {
                self.context.record_output(&step_id, result.output.clone());
                (
                    TraceEventKind::StepCompleted {
                        branch,
                        duration_ms: result.duration_ms,
                    },
                    Outcome::Completed,
                )
            }
            StepStatus::Skipped => (
                TraceEventKind::StepSkipped {
                    branch,
                    reason: result.trigger.reason.clone(),
                },
                Outcome::Skipped,
            ),
            StepStatus::Failed | StepStatus::Retried => (
                TraceEventKind::StepFailed {
                    branch,
                    error: result
                        .error
                        .clone()
                        .unwrap_or_else(|| StepError::handler("step failed without detail")),
                    duration_ms: result.duration_ms,
                },
                Outcome::Failed {
                    tolerated: self.tolerant.contains(&step_id),
                },
            ),
        };

        debug!(
            run_id = %self.context.run_id,
            step_id = %step_id,
            status = result.status.as_str(),
            branch = %result.trigger.branch,
            attempts = result.attempts,
            "step finished"
        );
        if result.attempts == 0 {
            self.tracer.pending_step_event(&step_id, kind);
        } else {
            self.tracer.step_event(&step_id, result.attempts, kind);
        }
        self.running.remove(&step_id);
        self.outcomes.insert(step_id, outcome);
        self.results.push(result);
    }

    fn absorb(&mut self, joined: std::result::Result<TaskOutput, JoinError>) {
        match joined {
            Ok((_, Ok(attempts))) => {
                self.retried.extend(attempts.superseded);
                self.finish(attempts.result);
            }
            Ok((step_id, Err(panic))) => {
                let message = format!("step '{step_id}' panicked: {panic}");
                error!(run_id = %self.context.run_id, "{message}");
                self.finish(StepResult::failed(
                    &step_id,
                    StepError::handler(message.clone()),
                    TriggerDecision::unevaluated(),
                    Utc::now(),
                ));
                self.fault.get_or_insert(message);
                self.run_token.cancel();
            }
            Err(err) => {
                error!(run_id = %self.context.run_id, "step task failed: {err}");
                self.fault.get_or_insert(format!("step task failed: {err}"));
                self.run_token.cancel();
            }
        }
    }

    fn first_blocking_failure(&self) -> Option<&StepResult> {
        self.results
            .iter()
            .find(|result| result.is_failed() && !self.tolerant.contains(&result.step_id))
    }
}

async fn run_step(job: StepJob) -> TaskOutput {
    let step_id = job.step.id.clone();
    let outcome = AssertUnwindSafe(attempt_with_retries(job))
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()));
    (step_id, outcome)
}

async fn attempt_with_retries(job: StepJob) -> StepAttempts {
    let mut superseded = Vec::new();
    let mut backoff_ms = job.policy.initial_backoff_ms;
    let mut attempt = 1u32;

    loop {
        let result = attempt_once(&job, attempt).await;
        let retry = result.is_failed()
            && !job.cancel.is_cancelled()
            && job.policy.allows(attempt, result.error_kind());
        if !retry {
            return StepAttempts { result, superseded };
        }

        if let Some(error) = &result.error {
            debug!(
                run_id = %job.scope.run_id,
                step_id = %job.step.id,
                attempt,
                backoff_ms,
                "retrying step after {error}"
            );
            job.scope.tracer.step_event(
                &job.step.id,
                attempt,
                TraceEventKind::StepRetried {
                    error: error.clone(),
                    next_delay_ms: backoff_ms,
                },
            );
        }

        if backoff_ms > 0 {
            tokio::select! {
                biased;
                _ = job.cancel.cancelled() => return StepAttempts { result, superseded },
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }
        }

        let mut previous = result;
        previous.status = StepStatus::Retried;
        superseded.push(previous);
        backoff_ms = next_backoff_ms(
            backoff_ms,
            job.policy.multiplier,
            job.policy.max_backoff_ms,
        );
        attempt += 1;
    }
}

async fn attempt_once(job: &StepJob, attempt: u32) -> StepResult {
    let started_at = Utc::now();
    let step_id = job.step.id.as_str();

    let mut budget = job.timeout;
    let mut capped_by_deadline = false;
    if let Some(deadline) = job.deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return StepResult::failed(
                step_id,
                deadline_error(),
                TriggerDecision::unevaluated(),
                started_at,
            )
            .with_attempt(attempt);
        }
        if remaining < budget {
            budget = remaining;
            capped_by_deadline = true;
        }
    }

    job.scope
        .tracer
        .step_event(step_id, attempt, TraceEventKind::StepStarted);
    let dispatch = job.dispatcher.dispatch(
        &job.step,
        &job.scope,
        job.variables.clone(),
        attempt,
        &job.cancel,
    );

    tokio::select! {
        biased;
        _ = job.cancel.cancelled() => StepResult::failed(
            step_id,
            StepError::cancelled(),
            TriggerDecision::unevaluated(),
            started_at,
        )
        .with_attempt(attempt),
        outcome = tokio::time::timeout(budget, dispatch) => match outcome {
            Ok(result) => result,
            Err(_) => {
                let error = if capped_by_deadline {
                    deadline_error()
                } else {
                    StepError::timeout(budget.as_secs())
                };
                StepResult::failed(step_id, error, TriggerDecision::unevaluated(), started_at)
                    .with_attempt(attempt)
            }
        },
    }
}

fn deadline_error() -> StepError {
    StepError::new(StepErrorKind::Timeout, "run deadline exhausted")
}

fn next_backoff_ms(current: u64, multiplier: f64, max_ms: u64) -> u64 {
    if current == 0 {
        return 0;
    }
    let scaled = (current as f64 * multiplier).round();
    let scaled = if scaled.is_finite() && scaled > 0.0 {
        scaled as u64
    } else {
        current
    };
    scaled.min(max_ms.max(1))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
