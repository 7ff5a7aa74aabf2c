use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analytics::{RunTracer, TraceEventKind};
use crate::config::KnowledgeSettings;
use crate::integrations::{
    KnowledgeChunk, KnowledgeProvider, KnowledgeQuery, NoopKnowledgeProvider,
    NoopPersonalityProvider, PersonalityProvider,
};
use crate::programs::expressions::{Environment, ExpressionEvaluator};
use crate::programs::registry::{ActionInvocation, HandlerError, HandlerRegistry, TriggerContext};
use crate::programs::run::{StepError, StepErrorKind, StepResult, TriggerDecision};
use crate::programs::template::render_value;
use crate::programs::types::{PersonalityConfig, Step};

/// Per-run values every dispatch of that run shares.
#[derive(Clone)]
pub struct RunScope {
    pub run_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub events: Arc<BTreeSet<String>>,
    pub now: DateTime<Utc>,
    pub personality: PersonalityConfig,
    pub tracer: RunTracer,
}

/// Runs one step: handler resolution, trigger, parameter rendering, action.
/// Never fails as a whole; every problem ends up inside the returned
/// [`StepResult`].
#[derive(Clone)]
pub struct StepDispatcher {
    registry: Arc<HandlerRegistry>,
    evaluator: Arc<ExpressionEvaluator>,
    knowledge: Arc<dyn KnowledgeProvider>,
    personality: Arc<dyn PersonalityProvider>,
    knowledge_settings: KnowledgeSettings,
}

impl StepDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, evaluator: Arc<ExpressionEvaluator>) -> Self {
        Self {
            registry,
            evaluator,
            knowledge: Arc::new(NoopKnowledgeProvider),
            personality: Arc::new(NoopPersonalityProvider),
            knowledge_settings: KnowledgeSettings::default(),
        }
    }

    pub fn with_knowledge(mut self, provider: Arc<dyn KnowledgeProvider>) -> Self {
        self.knowledge = provider;
        self
    }

    pub fn with_personality(mut self, provider: Arc<dyn PersonalityProvider>) -> Self {
        self.personality = provider;
        self
    }

    pub fn with_knowledge_settings(mut self, settings: KnowledgeSettings) -> Self {
        self.knowledge_settings = settings;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    pub async fn dispatch(
        &self,
        step: &Step,
        scope: &RunScope,
        variables: Arc<BTreeMap<String, Value>>,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started_at = Utc::now();
        let failed = |error: StepError, trigger: TriggerDecision| {
            StepResult::failed(&step.id, error, trigger, started_at).with_attempt(attempt)
        };

        if let Err(err) = self.registry.step(step.step_type.as_str()) {
            return failed(
                StepError::new(StepErrorKind::UnknownHandler, err.to_string()),
                TriggerDecision::unevaluated(),
            );
        }

        let trigger_handler = match self.registry.trigger(step.trigger.trigger_type.as_str()) {
            Ok(handler) => handler,
            Err(err) => {
                return failed(
                    StepError::new(StepErrorKind::UnknownHandler, err.to_string()),
                    TriggerDecision::unevaluated(),
                )
            }
        };

        let trigger_ctx = TriggerContext {
            run_id: &scope.run_id,
            tenant_id: &scope.tenant_id,
            attempt,
            variables: variables.as_ref(),
            events: scope.events.as_ref(),
            now: scope.now,
            evaluator: &self.evaluator,
            cancel,
            tracer: &scope.tracer,
        };
        let decision = match trigger_handler.evaluate(step, &trigger_ctx).await {
            Ok(decision) => decision,
            Err(error) => return failed(error, TriggerDecision::unevaluated()),
        };
        if !decision.fired {
            debug!(
                run_id = %scope.run_id,
                step_id = %step.id,
                branch = %decision.branch,
                "trigger held step"
            );
            return StepResult::skipped(&step.id, decision, started_at).with_attempt(attempt);
        }

        let action_type = step.action.action_type.as_str();
        let action = match self.registry.action(action_type) {
            Ok(handler) => handler,
            Err(err) => {
                return failed(
                    StepError::new(StepErrorKind::UnknownHandler, err.to_string()),
                    decision,
                )
            }
        };

        let env = Environment::new(variables.as_ref(), scope.now);
        let params = match render_value(&step.action.params, &self.evaluator, &env) {
            Ok(params) => params,
            Err(err) => {
                return failed(
                    StepError::evaluation(format!("failed rendering parameters: {err}")),
                    decision,
                )
            }
        };

        let mut metadata = Map::new();
        let knowledge = if step.action.use_knowledge_context {
            let chunks = self.knowledge_context(step, scope, &params).await;
            metadata.insert("knowledge_chunks".to_owned(), json!(chunks.len()));
            chunks
        } else {
            Vec::new()
        };

        let invocation = ActionInvocation {
            run_id: scope.run_id.clone(),
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            step_id: step.id.clone(),
            attempt,
            params,
            variables: variables.clone(),
            knowledge,
            use_personality: step.action.use_personality,
            personality: scope.personality.clone(),
            now: scope.now,
            cancel: cancel.clone(),
        };

        scope.tracer.step_event(
            &step.id,
            attempt,
            TraceEventKind::HandlerInvoked {
                handler: action_type.to_owned(),
            },
        );
        let invoked_at = Instant::now();
        let output = match action.execute(invocation).await {
            Ok(output) => {
                scope.tracer.step_event(
                    &step.id,
                    attempt,
                    TraceEventKind::HandlerReturned {
                        handler: action_type.to_owned(),
                        duration_ms: invoked_at.elapsed().as_millis() as u64,
                    },
                );
                output
            }
            Err(err) => {
                scope.tracer.step_event(
                    &step.id,
                    attempt,
                    TraceEventKind::HandlerError {
                        handler: action_type.to_owned(),
                        message: err.to_string(),
                    },
                );
                return failed(step_error(err), decision);
            }
        };
        let output = match output {
            Value::Object(_) => output,
            other => json!({ "value": other }),
        };

        if step.action.use_personality {
            if let Err(error) = self
                .score_personality(step, scope, &output, &mut metadata)
                .await
            {
                let mut result = failed(error, decision);
                result.metadata = metadata;
                return result;
            }
        }

        let mut result =
            StepResult::completed(&step.id, output, decision, started_at).with_attempt(attempt);
        result.metadata = metadata;
        result
    }

    async fn knowledge_context(
        &self,
        step: &Step,
        scope: &RunScope,
        params: &Value,
    ) -> Vec<KnowledgeChunk> {
        let query = ["knowledge_query", "message", "content"]
            .iter()
            .find_map(|key| params.get(*key).and_then(Value::as_str))
            .filter(|text| !text.trim().is_empty());
        let Some(query) = query else {
            debug!(step_id = %step.id, "no knowledge query text; skipping retrieval");
            return Vec::new();
        };

        let request = KnowledgeQuery {
            query: query.to_owned(),
            tenant_id: scope.tenant_id.clone(),
            limit: self.knowledge_settings.limit,
            threshold: self.knowledge_settings.threshold,
        };
        match self.knowledge.retrieve(&request).await {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(
                    run_id = %scope.run_id,
                    step_id = %step.id,
                    "knowledge retrieval failed, continuing without context: {err}"
                );
                Vec::new()
            }
        }
    }

    async fn score_personality(
        &self,
        step: &Step,
        scope: &RunScope,
        output: &Value,
        metadata: &mut Map<String, Value>,
    ) -> Result<(), StepError> {
        let Some(content) = output.get("content").and_then(Value::as_str) else {
            return Ok(());
        };
        let required = step.action.require_personality_consistency;

        match self
            .personality
            .score_consistency(content, &scope.tenant_id)
            .await
        {
            Ok(score) => {
                metadata.insert("personality_score".to_owned(), json!(score.overall_score));
                metadata.insert(
                    "personality_consistent".to_owned(),
                    Value::Bool(score.is_consistent),
                );
                if required && !score.is_consistent {
                    return Err(StepError::handler(format!(
                        "content failed personality consistency check (score {:.2})",
                        score.overall_score
                    )));
                }
                Ok(())
            }
            Err(err) => {
                warn!(
                    run_id = %scope.run_id,
                    step_id = %step.id,
                    "personality scoring failed: {err}"
                );
                if required {
                    return Err(StepError::handler(format!(
                        "personality consistency could not be checked: {err}"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn step_error(err: HandlerError) -> StepError {
    match err {
        HandlerError::Cancelled => StepError::cancelled(),
        HandlerError::Expression(inner) => StepError::evaluation(inner.to_string()),
        other => StepError::handler(other.to_string()),
    }
}
