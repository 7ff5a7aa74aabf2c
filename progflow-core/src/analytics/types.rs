use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::programs::run::{FailureReason, RunStatus, StepError};

/// One entry of a run's execution trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub run_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEventKind {
    RunStarted {
        program_id: String,
        version: u32,
        strategy: String,
    },
    StepStarted,
    ConditionEvaluated {
        expression: String,
        inputs: Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    HandlerInvoked {
        handler: String,
    },
    HandlerReturned {
        handler: String,
        duration_ms: u64,
    },
    HandlerError {
        handler: String,
        message: String,
    },
    StepRetried {
        error: StepError,
        next_delay_ms: u64,
    },
    StepCompleted {
        branch: String,
        duration_ms: u64,
    },
    StepSkipped {
        branch: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    StepFailed {
        branch: String,
        error: StepError,
        duration_ms: u64,
    },
    RunCompleted {
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_reason: Option<FailureReason>,
        elapsed_ms: u64,
    },
    RunCancelled,
}

impl TraceEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            TraceEventKind::RunStarted { .. } => "run_started",
            TraceEventKind::StepStarted => "step_started",
            TraceEventKind::ConditionEvaluated { .. } => "condition_evaluated",
            TraceEventKind::HandlerInvoked { .. } => "handler_invoked",
            TraceEventKind::HandlerReturned { .. } => "handler_returned",
            TraceEventKind::HandlerError { .. } => "handler_error",
            TraceEventKind::StepRetried { .. } => "step_retried",
            TraceEventKind::StepCompleted { .. } => "step_completed",
            TraceEventKind::StepSkipped { .. } => "step_skipped",
            TraceEventKind::StepFailed { .. } => "step_failed",
            TraceEventKind::RunCompleted { .. } => "run_completed",
            TraceEventKind::RunCancelled => "run_cancelled",
        }
    }
}

/// Aggregate view of a single run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub program_id: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub step_count: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub retries: u64,
    pub mean_step_latency_ms: f64,
    pub branch_histogram: BTreeMap<String, u64>,
    pub event_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// Aggregate view across every retained run of one program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramAnalytics {
    pub program_id: String,
    pub runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub mean_run_duration_ms: f64,
    pub step_failures: BTreeMap<String, u64>,
}
