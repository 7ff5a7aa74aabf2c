use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;

use crate::programs::expressions::{type_name, Environment, ExpressionError, ExpressionEvaluator};
use crate::programs::registry::{TriggerContext, TriggerHandler};
use crate::programs::run::{StepError, TriggerDecision};
use crate::programs::types::Step;

const DEFAULT_WINDOW_SECONDS: u64 = 60;
const MAX_WINDOW_SECONDS: u64 = 366 * 24 * 3600;

/// Always fires.
#[derive(Debug, Default)]
pub struct ImmediateTrigger;

#[async_trait]
impl TriggerHandler for ImmediateTrigger {
    async fn evaluate(
        &self,
        _step: &Step,
        _ctx: &TriggerContext<'_>,
    ) -> Result<TriggerDecision, StepError> {
        Ok(TriggerDecision::fire())
    }
}

/// Fires when the step's condition evaluates to `true` against the run
/// variables. Records a `condition_evaluated` event either way.
#[derive(Debug, Default)]
pub struct ConditionTrigger;

#[async_trait]
impl TriggerHandler for ConditionTrigger {
    async fn evaluate(
        &self,
        step: &Step,
        ctx: &TriggerContext<'_>,
    ) -> Result<TriggerDecision, StepError> {
        let expression = step
            .trigger
            .condition
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| StepError::evaluation("condition_based trigger has no condition"))?;

        let parsed = match ctx.evaluator.parse(expression) {
            Ok(parsed) => parsed,
            Err(err) => {
                ctx.record_condition(&step.id, expression, Map::new(), Err(err.to_string()));
                return Err(StepError::evaluation(err.to_string()));
            }
        };

        let inputs = parsed
            .identifiers()
            .into_iter()
            .filter_map(|name| ctx.variables.get(&name).map(|v| (name, v.clone())))
            .collect::<Map<String, Value>>();

        let env = Environment::new(ctx.variables, ctx.now);
        let outcome = ctx
            .evaluator
            .evaluate_parsed(&parsed, &env)
            .and_then(|value| match value {
                Value::Bool(result) => Ok(result),
                other => Err(ExpressionError::TypeMismatch(format!(
                    "condition must evaluate to a boolean, got {}",
                    type_name(&other)
                ))),
            });

        ctx.record_condition(
            &step.id,
            expression,
            inputs,
            outcome.clone().map_err(|err| err.to_string()),
        );

        match outcome {
            Ok(true) => Ok(TriggerDecision::fire_because(format!(
                "condition '{expression}' held"
            ))),
            Ok(false) => Ok(TriggerDecision::hold(format!(
                "condition '{expression}' was false"
            ))),
            Err(err) => Err(StepError::evaluation(err.to_string())),
        }
    }
}

/// Fires when a cron occurrence falls inside the trailing window, or once a
/// fixed `at` instant has passed.
#[derive(Debug, Default)]
pub struct TimeBasedTrigger;

impl TimeBasedTrigger {
    fn parse_schedule(expression: &str) -> Result<Schedule, String> {
        Schedule::from_str(expression.trim())
            .map_err(|err| format!("invalid cron schedule '{expression}': {err}"))
    }

    fn parse_at(text: &str) -> Result<DateTime<Utc>, String> {
        DateTime::parse_from_rfc3339(text.trim())
            .map(|instant| instant.with_timezone(&Utc))
            .map_err(|err| format!("invalid 'at' instant '{text}': {err}"))
    }
}

#[async_trait]
impl TriggerHandler for TimeBasedTrigger {
    async fn evaluate(
        &self,
        step: &Step,
        ctx: &TriggerContext<'_>,
    ) -> Result<TriggerDecision, StepError> {
        let trigger = &step.trigger;
        let window = trigger.window_seconds.unwrap_or(DEFAULT_WINDOW_SECONDS);

        if let Some(at) = trigger.at.as_deref() {
            let at = Self::parse_at(at).map_err(StepError::evaluation)?;
            if at <= ctx.now {
                return Ok(TriggerDecision::fire_because(format!("scheduled instant {at} reached")));
            }
            return Ok(TriggerDecision::hold(format!("scheduled for {at}")));
        }

        let Some(expression) = trigger.schedule.as_deref() else {
            return Err(StepError::evaluation(
                "time_based trigger needs a 'schedule' or an 'at' instant",
            ));
        };
        let schedule = Self::parse_schedule(expression).map_err(StepError::evaluation)?;
        let window_start = ctx.now - ChronoDuration::seconds(window.min(MAX_WINDOW_SECONDS) as i64);
        match schedule.after(&window_start).next() {
            Some(occurrence) if occurrence <= ctx.now => Ok(TriggerDecision::fire_because(
                format!("schedule '{expression}' matched at {occurrence}"),
            )),
            _ => Ok(TriggerDecision::hold(format!(
                "no occurrence of '{expression}' within the last {window}s"
            ))),
        }
    }

    fn validate(&self, step: &Step, _evaluator: &ExpressionEvaluator) -> Vec<String> {
        let trigger = &step.trigger;
        let mut issues = Vec::new();
        match (trigger.schedule.as_deref(), trigger.at.as_deref()) {
            (None, None) => issues.push("time_based trigger needs 'schedule' or 'at'".to_owned()),
            (Some(schedule), _) => {
                if let Err(err) = Self::parse_schedule(schedule) {
                    issues.push(err);
                }
            }
            (None, Some(at)) => {
                if let Err(err) = Self::parse_at(at) {
                    issues.push(err);
                }
            }
        }
        issues
    }
}

/// Fires when the caller reported the named user event for this run.
#[derive(Debug, Default)]
pub struct UserActionTrigger;

#[async_trait]
impl TriggerHandler for UserActionTrigger {
    async fn evaluate(
        &self,
        step: &Step,
        ctx: &TriggerContext<'_>,
    ) -> Result<TriggerDecision, StepError> {
        let event = step
            .trigger
            .event
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| StepError::evaluation("user_action trigger has no event name"))?;

        if ctx.events.contains(event) {
            Ok(TriggerDecision::fire_because(format!("event '{event}' received")))
        } else {
            Ok(TriggerDecision::hold(format!("event '{event}' not received")))
        }
    }

    fn validate(&self, step: &Step, _evaluator: &ExpressionEvaluator) -> Vec<String> {
        match step.trigger.event.as_deref() {
            Some(event) if !event.trim().is_empty() => Vec::new(),
            _ => vec!["user_action trigger needs an 'event' name".to_owned()],
        }
    }
}

/// Sleeps for `delay_seconds`, then fires. The delay counts against the
/// step's timeout.
#[derive(Debug, Default)]
pub struct DelayedTrigger;

#[async_trait]
impl TriggerHandler for DelayedTrigger {
    async fn evaluate(
        &self,
        step: &Step,
        ctx: &TriggerContext<'_>,
    ) -> Result<TriggerDecision, StepError> {
        let delay = step.trigger.delay_seconds.unwrap_or_default();
        if delay > 0 {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(StepError::cancelled()),
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
            }
        }
        Ok(TriggerDecision::fire_because(format!("delayed {delay}s")))
    }

    fn validate(&self, step: &Step, _evaluator: &ExpressionEvaluator) -> Vec<String> {
        if step.trigger.delay_seconds.is_none() {
            return vec!["delayed trigger needs 'delay_seconds'".to_owned()];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{DebugRecorder, RecordingOptions, RunTracer, TraceEventKind};
    use crate::programs::types::{ActionType, StepType, TriggerConfig, TriggerType};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        recorder: Arc<DebugRecorder>,
        tracer: RunTracer,
        evaluator: ExpressionEvaluator,
        variables: BTreeMap<String, Value>,
        events: BTreeSet<String>,
        cancel: CancellationToken,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new(variables: Value) -> Self {
            let recorder = Arc::new(DebugRecorder::new(4));
            recorder.begin_run(
                "run",
                "p",
                1,
                RecordingOptions {
                    tracking: true,
                    debug: true,
                },
            );
            Self {
                tracer: RunTracer::new(recorder.clone(), "run"),
                recorder,
                evaluator: ExpressionEvaluator::new(),
                variables: variables
                    .as_object()
                    .map(|m| m.clone().into_iter().collect())
                    .unwrap_or_default(),
                events: BTreeSet::new(),
                cancel: CancellationToken::new(),
                now: Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 30).unwrap(),
            }
        }

        fn ctx(&self) -> TriggerContext<'_> {
            TriggerContext {
                run_id: "run",
                tenant_id: "t",
                attempt: 1,
                variables: &self.variables,
                events: &self.events,
                now: self.now,
                evaluator: &self.evaluator,
                cancel: &self.cancel,
                tracer: &self.tracer,
            }
        }
    }

    fn step(trigger: TriggerConfig) -> Step {
        Step::new("s", StepType::Condition, ActionType::SendMessage).with_trigger(trigger)
    }

    #[tokio::test]
    async fn condition_trigger_records_inputs_and_result() {
        let fixture = Fixture::new(json!({"age": 20, "verified": true, "unused": 1}));
        let step = step(TriggerConfig::condition("age >= 18 AND verified = true"));

        let decision = ConditionTrigger.evaluate(&step, &fixture.ctx()).await.unwrap();
        assert!(decision.fired);
        assert_eq!(decision.branch, "taken");

        let trace = fixture.recorder.trace("run").unwrap();
        assert_eq!(trace.len(), 1);
        match &trace[0].kind {
            TraceEventKind::ConditionEvaluated { inputs, result, .. } => {
                assert_eq!(result, &Some(true));
                assert_eq!(inputs.get("age"), Some(&json!(20)));
                assert!(!inputs.contains_key("unused"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn false_condition_is_not_taken() {
        let fixture = Fixture::new(json!({"orders": []}));
        let step = step(TriggerConfig::condition("COUNT(orders) > 0"));
        let decision = ConditionTrigger.evaluate(&step, &fixture.ctx()).await.unwrap();
        assert!(!decision.fired);
        assert_eq!(decision.branch, "not_taken");
    }

    #[tokio::test]
    async fn condition_errors_are_evaluation_failures() {
        let fixture = Fixture::new(json!({}));
        for condition in ["unknown_var > 1", "1 +", "1 + 1"] {
            let err = ConditionTrigger
                .evaluate(&step(TriggerConfig::condition(condition)), &fixture.ctx())
                .await
                .unwrap_err();
            assert_eq!(err.kind, crate::programs::run::StepErrorKind::Evaluation);
        }
    }

    #[tokio::test]
    async fn cron_schedule_fires_inside_the_window() {
        let fixture = Fixture::new(json!({}));
        let every_minute = step(TriggerConfig {
            trigger_type: TriggerType::TimeBased,
            schedule: Some("0 * * * * *".to_owned()),
            ..TriggerConfig::default()
        });
        assert!(TimeBasedTrigger
            .evaluate(&every_minute, &fixture.ctx())
            .await
            .unwrap()
            .fired);

        let yearly = step(TriggerConfig {
            trigger_type: TriggerType::TimeBased,
            schedule: Some("0 0 0 1 1 *".to_owned()),
            window_seconds: Some(10),
            ..TriggerConfig::default()
        });
        assert!(!TimeBasedTrigger
            .evaluate(&yearly, &fixture.ctx())
            .await
            .unwrap()
            .fired);
    }

    #[tokio::test]
    async fn at_instant_fires_once_reached() {
        let fixture = Fixture::new(json!({}));
        let past = step(TriggerConfig {
            trigger_type: TriggerType::TimeBased,
            at: Some("2024-05-01T00:00:00Z".to_owned()),
            ..TriggerConfig::default()
        });
        let future = step(TriggerConfig {
            trigger_type: TriggerType::TimeBased,
            at: Some("2030-01-01T00:00:00Z".to_owned()),
            ..TriggerConfig::default()
        });
        assert!(TimeBasedTrigger.evaluate(&past, &fixture.ctx()).await.unwrap().fired);
        assert!(!TimeBasedTrigger.evaluate(&future, &fixture.ctx()).await.unwrap().fired);
    }

    #[test]
    fn time_based_validation_flags_bad_cron() {
        let bad = step(TriggerConfig {
            trigger_type: TriggerType::TimeBased,
            schedule: Some("every tuesday".to_owned()),
            ..TriggerConfig::default()
        });
        assert_eq!(
            TimeBasedTrigger
                .validate(&bad, &ExpressionEvaluator::new())
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn user_action_requires_the_event() {
        let mut fixture = Fixture::new(json!({}));
        let step = step(TriggerConfig::user_action("clicked_cta"));
        assert!(!UserActionTrigger.evaluate(&step, &fixture.ctx()).await.unwrap().fired);

        fixture.events.insert("clicked_cta".to_owned());
        assert!(UserActionTrigger.evaluate(&step, &fixture.ctx()).await.unwrap().fired);
    }

    #[tokio::test]
    async fn delayed_trigger_honors_cancellation() {
        let fixture = Fixture::new(json!({}));
        fixture.cancel.cancel();
        let err = DelayedTrigger
            .evaluate(&step(TriggerConfig::delayed(30)), &fixture.ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::programs::run::StepErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn zero_delay_fires_immediately() {
        let fixture = Fixture::new(json!({}));
        let decision = DelayedTrigger
            .evaluate(&step(TriggerConfig::delayed(0)), &fixture.ctx())
            .await
            .unwrap();
        assert!(decision.fired);
    }
}
