use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{Error, Result};

/// Reserved variable holding completed step outputs keyed by step id.
pub const STEPS_VARIABLE: &str = "steps";

pub const BRANCH_TAKEN: &str = "taken";
pub const BRANCH_NOT_TAKEN: &str = "not_taken";
pub const BRANCH_UPSTREAM_FAILED: &str = "upstream_failed";
pub const BRANCH_ALL_PREDECESSORS_SKIPPED: &str = "branch_not_taken";
pub const BRANCH_UNREACHABLE: &str = "unreachable";
pub const BRANCH_CANCELLED: &str = "cancelled";
pub const BRANCH_UNEVALUATED: &str = "unevaluated";

/// What a caller submits to start a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub variables: BTreeMap<String, Value>,
    pub events: Vec<String>,
    pub debug_mode: bool,
}

impl RunRequest {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }
}

/// Mutable state of one run. Only the engine loop writes to it.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    /// Retain the full event trace for this run.
    pub debug_mode: bool,
    variables: BTreeMap<String, Value>,
    events: BTreeSet<String>,
    now: DateTime<Utc>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, tenant_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(STEPS_VARIABLE.to_owned(), Value::Object(Map::new()));
        Self {
            run_id: run_id.into(),
            tenant_id: tenant_id.into(),
            user_id: None,
            debug_mode: false,
            variables,
            events: BTreeSet::new(),
            now,
        }
    }

    pub fn from_request(run_id: impl Into<String>, request: &RunRequest, now: DateTime<Utc>) -> Result<Self> {
        let mut context = Self::new(run_id, request.tenant_id.clone(), now);
        context.user_id = request.user_id.clone();
        context.debug_mode = request.debug_mode;
        for (name, value) in &request.variables {
            context.set_variable(name.clone(), value.clone())?;
        }
        context.events.extend(request.events.iter().cloned());
        Ok(context)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) -> Result<()> {
        let name = name.into();
        if name == STEPS_VARIABLE {
            return Err(Error::Validation(format!(
                "variable '{STEPS_VARIABLE}' is reserved for step outputs"
            )));
        }
        self.variables.insert(name, value);
        Ok(())
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Immutable copy handed to a dispatched step.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, Value>> {
        Arc::new(self.variables.clone())
    }

    pub fn record_output(&mut self, step_id: &str, output: Value) {
        let steps = self
            .variables
            .entry(STEPS_VARIABLE.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !steps.is_object() {
            *steps = Value::Object(Map::new());
        }
        if let Value::Object(map) = steps {
            map.insert(step_id.to_owned(), output);
        }
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.variables.get(STEPS_VARIABLE)?.get(step_id)
    }

    pub fn events(&self) -> &BTreeSet<String> {
        &self.events
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.contains(event)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn into_variables(self) -> BTreeMap<String, Value> {
        self.variables
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Evaluation,
    UnknownHandler,
    Handler,
    Timeout,
    Cancelled,
}

impl StepErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StepErrorKind::Evaluation | StepErrorKind::Handler | StepErrorKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepErrorKind::Evaluation => "evaluation",
            StepErrorKind::UnknownHandler => "unknown_handler",
            StepErrorKind::Handler => "handler",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Evaluation, message)
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Handler, message)
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::new(
            StepErrorKind::Timeout,
            format!("step exceeded timeout of {seconds} seconds"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(StepErrorKind::Cancelled, "run was cancelled")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerDecision {
    pub fired: bool,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TriggerDecision {
    pub fn fire() -> Self {
        Self {
            fired: true,
            branch: BRANCH_TAKEN.to_owned(),
            reason: None,
        }
    }

    pub fn fire_because(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::fire()
        }
    }

    /// Placeholder for results produced before the trigger ran.
    pub fn unevaluated() -> Self {
        Self {
            fired: false,
            branch: BRANCH_UNEVALUATED.to_owned(),
            reason: None,
        }
    }

    pub fn hold(reason: impl Into<String>) -> Self {
        Self::skip(BRANCH_NOT_TAKEN, reason)
    }

    pub fn skip(branch: &str, reason: impl Into<String>) -> Self {
        Self {
            fired: false,
            branch: branch.to_owned(),
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
    Retried,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
            StepStatus::Retried => "retried",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempts: u32,
    pub trigger: TriggerDecision,
    pub metadata: Map<String, Value>,
}

impl StepResult {
    pub fn completed(
        step_id: &str,
        output: Value,
        trigger: TriggerDecision,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::finish(step_id, StepStatus::Completed, output, None, trigger, started_at)
    }

    pub fn failed(
        step_id: &str,
        error: StepError,
        trigger: TriggerDecision,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::finish(
            step_id,
            StepStatus::Failed,
            Value::Object(Map::new()),
            Some(error),
            trigger,
            started_at,
        )
    }

    pub fn skipped(step_id: &str, trigger: TriggerDecision, started_at: DateTime<Utc>) -> Self {
        Self::finish(
            step_id,
            StepStatus::Skipped,
            Value::Object(Map::new()),
            None,
            trigger,
            started_at,
        )
    }

    fn finish(
        step_id: &str,
        status: StepStatus,
        output: Value,
        error: Option<StepError>,
        trigger: TriggerDecision,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            step_id: step_id.to_owned(),
            status,
            output,
            error,
            started_at,
            finished_at,
            duration_ms,
            attempts: 1,
            trigger,
            metadata: Map::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempts = attempt;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn error_kind(&self) -> Option<StepErrorKind> {
        self.error.as_ref().map(|error| error.kind)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    StepFailed { step_id: String },
    Cancelled,
    DeadlineExceeded,
    EngineFault { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StepFailed { step_id } => write!(f, "step '{step_id}' failed"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::DeadlineExceeded => f.write_str("run deadline exceeded"),
            FailureReason::EngineFault { message } => write!(f, "engine fault: {message}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub program_id: String,
    pub version: u32,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub steps: Vec<StepResult>,
    pub retried: Vec<StepResult>,
    pub variables: BTreeMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|result| result.step_id == step_id)
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn attempts_for(&self, step_id: &str) -> usize {
        self.retried
            .iter()
            .chain(self.steps.iter())
            .filter(|result| result.step_id == step_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outputs_land_under_the_step_id() {
        let mut context = RunContext::new("run-1", "tenant", Utc::now());
        context.set_variable("age", json!(20)).unwrap();
        context.record_output("welcome", json!({"delivered": true}));

        assert_eq!(
            context.step_output("welcome"),
            Some(&json!({"delivered": true}))
        );
        assert_eq!(
            context.variables().get("steps"),
            Some(&json!({"welcome": {"delivered": true}}))
        );
    }

    #[test]
    fn steps_variable_is_reserved() {
        let request = RunRequest::for_tenant("t").with_variable("steps", json!({}));
        let err = RunContext::from_request("run", &request, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let mut context = RunContext::new("run", "t", Utc::now());
        let snapshot = context.snapshot();
        context.record_output("a", json!({"n": 1}));
        assert_eq!(snapshot.get("steps"), Some(&json!({})));
    }

    #[test]
    fn retryable_kinds() {
        assert!(StepErrorKind::Handler.is_retryable());
        assert!(StepErrorKind::Timeout.is_retryable());
        assert!(StepErrorKind::Evaluation.is_retryable());
        assert!(!StepErrorKind::UnknownHandler.is_retryable());
        assert!(!StepErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn failure_reason_serializes_with_kind_tag() {
        let value = serde_json::to_value(FailureReason::StepFailed {
            step_id: "a".to_owned(),
        })
        .unwrap();
        assert_eq!(value, json!({"kind": "step_failed", "step_id": "a"}));
    }
}
