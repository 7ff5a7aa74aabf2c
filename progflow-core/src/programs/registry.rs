use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::analytics::{RunTracer, TraceEventKind};
use crate::error::{Error, HandlerKind, Result};
use crate::integrations::KnowledgeChunk;
use crate::programs::expressions::{ExpressionError, ExpressionEvaluator};
use crate::programs::run::{StepError, TriggerDecision};
use crate::programs::types::{PersonalityConfig, Step};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Static rules for one step type.
pub trait StepHandler: Send + Sync {
    fn validate(&self, step: &Step) -> Vec<String>;
}

/// Everything a trigger may look at while deciding whether its step fires.
pub struct TriggerContext<'a> {
    pub run_id: &'a str,
    pub tenant_id: &'a str,
    pub attempt: u32,
    pub variables: &'a BTreeMap<String, Value>,
    pub events: &'a BTreeSet<String>,
    pub now: DateTime<Utc>,
    pub evaluator: &'a ExpressionEvaluator,
    pub cancel: &'a CancellationToken,
    pub tracer: &'a RunTracer,
}

impl TriggerContext<'_> {
    pub fn record_condition(
        &self,
        step_id: &str,
        expression: &str,
        inputs: Map<String, Value>,
        outcome: std::result::Result<bool, String>,
    ) {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(message) => (None, Some(message)),
        };
        self.tracer.step_event(
            step_id,
            self.attempt,
            TraceEventKind::ConditionEvaluated {
                expression: expression.to_owned(),
                inputs,
                result,
                error,
            },
        );
    }
}

#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn evaluate(
        &self,
        step: &Step,
        ctx: &TriggerContext<'_>,
    ) -> std::result::Result<TriggerDecision, StepError>;

    /// Static checks on the trigger parameters of `step`.
    fn validate(&self, _step: &Step, _evaluator: &ExpressionEvaluator) -> Vec<String> {
        Vec::new()
    }
}

/// A single action call. Owned so handlers can move parts into spawned work.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub run_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub step_id: String,
    pub attempt: u32,
    pub params: Value,
    pub variables: Arc<BTreeMap<String, Value>>,
    pub knowledge: Vec<KnowledgeChunk>,
    pub use_personality: bool,
    pub personality: PersonalityConfig,
    /// Run clock, fixed for the whole run.
    pub now: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl ActionInvocation {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn required_str(&self, key: &str) -> std::result::Result<&str, HandlerError> {
        self.str_param(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| HandlerError::InvalidParams(format!("missing string parameter '{key}'")))
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, invocation: ActionInvocation) -> std::result::Result<Value, HandlerError>;

    /// Static checks on the action parameters of `step`.
    fn validate(&self, _step: &Step) -> Vec<String> {
        Vec::new()
    }
}

/// Type-id to handler tables. Built once, then shared read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    steps: HashMap<String, Arc<dyn StepHandler>>,
    triggers: HashMap<String, Arc<dyn TriggerHandler>>,
    actions: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_step(&mut self, type_id: &str, handler: Arc<dyn StepHandler>) -> Result<()> {
        insert_unique(&mut self.steps, HandlerKind::Step, type_id, handler)
    }

    pub fn register_trigger(
        &mut self,
        type_id: &str,
        handler: Arc<dyn TriggerHandler>,
    ) -> Result<()> {
        insert_unique(&mut self.triggers, HandlerKind::Trigger, type_id, handler)
    }

    pub fn register_action(&mut self, type_id: &str, handler: Arc<dyn ActionHandler>) -> Result<()> {
        insert_unique(&mut self.actions, HandlerKind::Action, type_id, handler)
    }

    pub fn replace_step(&mut self, type_id: &str, handler: Arc<dyn StepHandler>) {
        self.steps.insert(type_id.to_owned(), handler);
    }

    pub fn replace_trigger(&mut self, type_id: &str, handler: Arc<dyn TriggerHandler>) {
        self.triggers.insert(type_id.to_owned(), handler);
    }

    pub fn replace_action(&mut self, type_id: &str, handler: Arc<dyn ActionHandler>) {
        self.actions.insert(type_id.to_owned(), handler);
    }

    pub fn step(&self, type_id: &str) -> Result<Arc<dyn StepHandler>> {
        lookup(&self.steps, HandlerKind::Step, type_id)
    }

    pub fn trigger(&self, type_id: &str) -> Result<Arc<dyn TriggerHandler>> {
        lookup(&self.triggers, HandlerKind::Trigger, type_id)
    }

    pub fn action(&self, type_id: &str) -> Result<Arc<dyn ActionHandler>> {
        lookup(&self.actions, HandlerKind::Action, type_id)
    }

    pub fn contains(&self, kind: HandlerKind, type_id: &str) -> bool {
        match kind {
            HandlerKind::Step => self.steps.contains_key(type_id),
            HandlerKind::Trigger => self.triggers.contains_key(type_id),
            HandlerKind::Action => self.actions.contains_key(type_id),
        }
    }

    pub fn list(&self, kind: HandlerKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            HandlerKind::Step => self.steps.keys().cloned().collect(),
            HandlerKind::Trigger => self.triggers.keys().cloned().collect(),
            HandlerKind::Action => self.actions.keys().cloned().collect(),
        };
        names.sort();
        names
    }
}

fn insert_unique<H: ?Sized>(
    table: &mut HashMap<String, Arc<H>>,
    kind: HandlerKind,
    type_id: &str,
    handler: Arc<H>,
) -> Result<()> {
    let type_id = type_id.trim();
    if type_id.is_empty() {
        return Err(Error::Validation(format!("{kind} handler type id cannot be empty")));
    }
    if table.contains_key(type_id) {
        return Err(Error::DuplicateHandler {
            kind,
            type_id: type_id.to_owned(),
        });
    }
    table.insert(type_id.to_owned(), handler);
    Ok(())
}

fn lookup<H: ?Sized>(
    table: &HashMap<String, Arc<H>>,
    kind: HandlerKind,
    type_id: &str,
) -> Result<Arc<H>> {
    table
        .get(type_id)
        .cloned()
        .ok_or_else(|| Error::UnknownHandler {
            kind,
            type_id: type_id.to_owned(),
        })
}
