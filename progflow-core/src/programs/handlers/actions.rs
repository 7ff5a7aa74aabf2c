use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::integrations::PersonalityProvider;
use crate::programs::registry::{ActionHandler, ActionInvocation, HandlerError};
use crate::programs::template;
use crate::programs::types::Step;

const MAX_WAIT_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

fn ensure_live(invocation: &ActionInvocation) -> Result<(), HandlerError> {
    if invocation.cancel.is_cancelled() {
        return Err(HandlerError::Cancelled);
    }
    Ok(())
}

/// Stable per-step identifier so a retried attempt refers to the same
/// delivery.
fn effect_id(prefix: &str, invocation: &ActionInvocation) -> String {
    format!("{prefix}-{}-{}", invocation.run_id, invocation.step_id)
}

fn message_content(params: &Value) -> Option<&str> {
    params
        .get("message")
        .or_else(|| params.get("content"))
        .and_then(Value::as_str)
}

pub struct SendMessageAction {
    personality: Arc<dyn PersonalityProvider>,
}

impl SendMessageAction {
    pub fn new(personality: Arc<dyn PersonalityProvider>) -> Self {
        Self { personality }
    }
}

#[async_trait]
impl ActionHandler for SendMessageAction {
    async fn execute(&self, invocation: ActionInvocation) -> Result<Value, HandlerError> {
        ensure_live(&invocation)?;
        let base = message_content(&invocation.params)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                HandlerError::InvalidParams("send_message needs 'message' or 'content'".to_owned())
            })?
            .to_owned();
        let channel = invocation.str_param("channel").unwrap_or("in_app").to_owned();

        let mut content = base.clone();
        let mut personality_confidence = Value::Null;
        if invocation.use_personality {
            let context = json!({
                "adaptation_level": invocation.personality.adaptation_level,
                "knowledge": invocation.knowledge,
                "user_id": invocation.user_id,
            });
            let enhanced = tokio::select! {
                _ = invocation.cancel.cancelled() => return Err(HandlerError::Cancelled),
                result = self.personality.enhance(&base, &invocation.tenant_id, &context) => result,
            };
            match enhanced {
                Ok(enhanced) => {
                    content = enhanced.enhanced_content;
                    personality_confidence = json!(enhanced.confidence_score);
                }
                Err(err) => warn!(
                    run_id = %invocation.run_id,
                    step_id = %invocation.step_id,
                    "personality enhancement failed, sending base content: {err}"
                ),
            }
        }

        let knowledge_sources = invocation
            .knowledge
            .iter()
            .map(|chunk| chunk.source.clone())
            .collect::<Vec<_>>();

        Ok(json!({
            "message_id": effect_id("msg", &invocation),
            "channel": channel,
            "recipient": invocation.user_id,
            "content": content,
            "delivered": true,
            "knowledge_sources": knowledge_sources,
            "personality_confidence": personality_confidence,
        }))
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        match message_content(&step.action.params) {
            Some(text) if !text.trim().is_empty() => Vec::new(),
            _ => vec!["send_message needs a non-empty 'message' or 'content' parameter".to_owned()],
        }
    }
}

#[derive(Debug, Default)]
pub struct AssignTaskAction;

#[async_trait]
impl ActionHandler for AssignTaskAction {
    async fn execute(&self, invocation: ActionInvocation) -> Result<Value, HandlerError> {
        ensure_live(&invocation)?;
        let title = invocation.required_str("title")?.to_owned();
        let description = invocation.str_param("description").unwrap_or_default().to_owned();
        let assignee = invocation
            .str_param("assignee")
            .map(str::to_owned)
            .or_else(|| invocation.user_id.clone());

        let due_at = match invocation.param("due_in_days") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let days = value.as_f64().filter(|d| d.is_finite() && *d >= 0.0).ok_or_else(|| {
                    HandlerError::InvalidParams("'due_in_days' must be a non-negative number".to_owned())
                })?;
                let seconds = (days * 86_400.0).round().min(3_650.0 * 86_400.0) as i64;
                Some(
                    (invocation.now + ChronoDuration::seconds(seconds))
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                )
            }
        };

        Ok(json!({
            "task_id": effect_id("task", &invocation),
            "title": title,
            "description": description,
            "assignee": assignee,
            "due_at": due_at,
            "status": "assigned",
        }))
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        match step.param("title").and_then(Value::as_str) {
            Some(title) if !title.trim().is_empty() => Vec::new(),
            _ => vec!["assign_task needs a non-empty 'title' parameter".to_owned()],
        }
    }
}

#[derive(Debug, Default)]
pub struct SendSurveyAction;

#[async_trait]
impl ActionHandler for SendSurveyAction {
    async fn execute(&self, invocation: ActionInvocation) -> Result<Value, HandlerError> {
        ensure_live(&invocation)?;
        let questions = invocation
            .param("questions")
            .and_then(Value::as_array)
            .filter(|questions| !questions.is_empty())
            .ok_or_else(|| {
                HandlerError::InvalidParams("send_survey needs a non-empty 'questions' list".to_owned())
            })?;
        let survey_id = invocation
            .str_param("survey_id")
            .map(str::to_owned)
            .unwrap_or_else(|| effect_id("survey", &invocation));

        Ok(json!({
            "survey_id": survey_id,
            "question_count": questions.len(),
            "recipient": invocation.user_id,
            "status": "sent",
        }))
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        match step.param("questions") {
            Some(Value::Array(items)) if !items.is_empty() => Vec::new(),
            Some(Value::String(text)) if template::has_placeholders(text) => Vec::new(),
            _ => vec!["send_survey needs a non-empty 'questions' list".to_owned()],
        }
    }
}

/// Sleeps for `duration_seconds`, returning early with an error on
/// cancellation.
#[derive(Debug, Default)]
pub struct WaitAction;

impl WaitAction {
    fn duration(params: &Value) -> Result<Duration, HandlerError> {
        let seconds = params
            .get("duration_seconds")
            .or_else(|| params.get("seconds"))
            .and_then(Value::as_f64)
            .filter(|s| s.is_finite() && *s >= 0.0)
            .ok_or_else(|| {
                HandlerError::InvalidParams(
                    "wait needs a non-negative 'duration_seconds' parameter".to_owned(),
                )
            })?;
        if seconds > MAX_WAIT_SECONDS {
            return Err(HandlerError::InvalidParams(format!(
                "wait of {seconds}s exceeds the maximum of {MAX_WAIT_SECONDS}s"
            )));
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}

#[async_trait]
impl ActionHandler for WaitAction {
    async fn execute(&self, invocation: ActionInvocation) -> Result<Value, HandlerError> {
        let duration = Self::duration(&invocation.params)?;
        tokio::select! {
            _ = invocation.cancel.cancelled() => Err(HandlerError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(json!({ "waited_ms": duration.as_millis() as u64 })),
        }
    }

    fn validate(&self, step: &Step) -> Vec<String> {
        let params = &step.action.params;
        let templated = params
            .get("duration_seconds")
            .or_else(|| params.get("seconds"))
            .and_then(Value::as_str)
            .is_some_and(template::has_placeholders);
        if templated {
            return Vec::new();
        }
        match Self::duration(params) {
            Ok(_) => Vec::new(),
            Err(err) => vec![err.to_string()],
        }
    }
}
