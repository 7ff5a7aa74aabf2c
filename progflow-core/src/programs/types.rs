use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};

/// Declares a type identifier with a closed set of built-in ids plus a
/// `Custom` escape hatch resolved through the handler registry.
macro_rules! open_type_id {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $id:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Custom(String),
        }

        impl $name {
            pub const BUILTIN: &'static [&'static str] = &[$($id),+];

            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $id,)+
                    Self::Custom(value) => value,
                }
            }

            pub fn is_builtin(&self) -> bool {
                !matches!(self, Self::Custom(_))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $($id => Self::$variant,)+
                    _ => Self::Custom(value),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from(value.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_owned()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

open_type_id!(StepType {
    Message => "message",
    Task => "task",
    Survey => "survey",
    Wait => "wait",
    Condition => "condition",
    Trigger => "trigger",
});

open_type_id!(TriggerType {
    Immediate => "immediate",
    TimeBased => "time_based",
    ConditionBased => "condition_based",
    UserAction => "user_action",
    Delayed => "delayed",
});

open_type_id!(ActionType {
    SendMessage => "send_message",
    AssignTask => "assign_task",
    SendSurvey => "send_survey",
    Wait => "wait",
    CallExternal => "call_external",
});

impl Default for StepType {
    fn default() -> Self {
        StepType::Message
    }
}

impl Default for TriggerType {
    fn default() -> Self {
        TriggerType::Immediate
    }
}

impl Default for ActionType {
    fn default() -> Self {
        ActionType::SendMessage
    }
}

impl TriggerType {
    /// Trigger types fired from outside the run, so a step carrying one can
    /// start the graph without a predecessor.
    pub fn is_entry_capable(&self) -> bool {
        matches!(
            self,
            TriggerType::Immediate | TriggerType::UserAction | TriggerType::TimeBased
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
    Conditional,
}

impl ExecutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStrategy::Sequential => "sequential",
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Conditional => "conditional",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Program {
    pub id: String,
    pub creator_id: String,
    pub version: u32,
    pub name: String,
    pub description: String,
    pub status: ProgramStatus,
    pub steps: Vec<Step>,
    pub execution: ExecutionConfig,
    pub analytics: AnalyticsConfig,
    pub personality: PersonalityConfig,
}

impl Default for Program {
    fn default() -> Self {
        Self {
            id: String::new(),
            creator_id: String::new(),
            version: 1,
            name: String::new(),
            description: String::new(),
            status: ProgramStatus::Draft,
            steps: Vec::new(),
            execution: ExecutionConfig::default(),
            analytics: AnalyticsConfig::default(),
            personality: PersonalityConfig::default(),
        }
    }
}

impl Program {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn is_executable(&self) -> bool {
        self.status != ProgramStatus::Archived
    }

    /// Fails when the program is published and must be versioned instead of
    /// edited in place.
    pub fn ensure_editable(&self) -> Result<()> {
        if self.status == ProgramStatus::Published {
            return Err(Error::Validation(format!(
                "program '{}' v{} is published; create a new version to edit it",
                self.id, self.version
            )));
        }
        Ok(())
    }

    /// Draft copy of this program with the version bumped.
    pub fn next_version(&self) -> Program {
        let mut next = self.clone();
        next.version = self.version.saturating_add(1);
        next.status = ProgramStatus::Draft;
        next
    }

    pub fn publish(&mut self) -> Result<()> {
        match self.status {
            ProgramStatus::Draft => {
                self.status = ProgramStatus::Published;
                Ok(())
            }
            ProgramStatus::Published => Ok(()),
            ProgramStatus::Archived => Err(Error::Validation(format!(
                "program '{}' v{} is archived and cannot be published",
                self.id, self.version
            ))),
        }
    }

    pub fn archive(&mut self) {
        self.status = ProgramStatus::Archived;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub strategy: ExecutionStrategy,
    pub parallel_limit: usize,
    pub timeout_seconds: u64,
    pub retry_failed_steps: bool,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub run_deadline_seconds: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::Sequential,
            parallel_limit: 4,
            timeout_seconds: 300,
            retry_failed_steps: true,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            run_deadline_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub enable_tracking: bool,
    pub store_debug_info: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enable_tracking: true,
            store_debug_info: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationLevel {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PersonalityConfig {
    pub enabled: bool,
    pub adaptation_level: AdaptationLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Step {
    pub id: String,
    pub program_id: String,
    pub name: String,
    pub step_type: StepType,
    pub trigger: TriggerConfig,
    pub action: ActionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<StepPosition>,
    pub next: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    pub continue_on_failure: bool,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            id: String::new(),
            program_id: String::new(),
            name: String::new(),
            step_type: StepType::default(),
            trigger: TriggerConfig::default(),
            action: ActionConfig::default(),
            position: None,
            next: Vec::new(),
            timeout_seconds: None,
            continue_on_failure: false,
        }
    }
}

impl Step {
    pub fn new(id: impl Into<String>, step_type: StepType, action_type: ActionType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            action: ActionConfig {
                action_type,
                ..ActionConfig::default()
            },
            ..Step::default()
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.action.params = params;
        self
    }

    pub fn then(mut self, successor: impl Into<String>) -> Self {
        self.next.push(successor.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.action.params.get(key)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct StepPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
}

impl TriggerConfig {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn condition(expression: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::ConditionBased,
            condition: Some(expression.into()),
            ..Self::default()
        }
    }

    pub fn delayed(seconds: u64) -> Self {
        Self {
            trigger_type: TriggerType::Delayed,
            delay_seconds: Some(seconds),
            ..Self::default()
        }
    }

    pub fn user_action(event: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::UserAction,
            event: Some(event.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionConfig {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub params: Value,
    pub use_knowledge_context: bool,
    pub use_personality: bool,
    pub require_personality_consistency: bool,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            action_type: ActionType::default(),
            params: Value::Object(serde_json::Map::new()),
            use_knowledge_context: false,
            use_personality: false,
            require_personality_consistency: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_type_ids_round_trip_through_strings() {
        assert_eq!(StepType::from("survey"), StepType::Survey);
        assert_eq!(
            StepType::from("webhook"),
            StepType::Custom("webhook".to_owned())
        );
        assert_eq!(TriggerType::from("time_based").as_str(), "time_based");
        assert!(!ActionType::from("notify_slack").is_builtin());

        let value = serde_json::to_value(ActionType::CallExternal).unwrap();
        assert_eq!(value, json!("call_external"));
    }

    #[test]
    fn deserializes_program_with_defaults() {
        let program: Program = serde_json::from_value(json!({
            "id": "onboarding",
            "steps": [
                {
                    "id": "welcome",
                    "step_type": "message",
                    "action": {"type": "send_message", "params": {"message": "hi"}},
                    "next": ["check"]
                },
                {
                    "id": "check",
                    "step_type": "condition",
                    "trigger": {"type": "condition_based", "condition": "age >= 18"},
                    "action": {"type": "send_message"}
                }
            ]
        }))
        .unwrap();

        assert_eq!(program.version, 1);
        assert_eq!(program.status, ProgramStatus::Draft);
        assert_eq!(program.execution.strategy, ExecutionStrategy::Sequential);
        assert_eq!(program.steps[0].trigger.trigger_type, TriggerType::Immediate);
        assert_eq!(
            program.steps[1].trigger.condition.as_deref(),
            Some("age >= 18")
        );
        assert_eq!(program.step("welcome").unwrap().next, vec!["check"]);
    }

    #[test]
    fn published_programs_are_versioned_instead_of_edited() {
        let mut program = Program {
            id: "p".to_owned(),
            version: 3,
            ..Program::default()
        };
        assert!(program.ensure_editable().is_ok());

        program.publish().unwrap();
        assert!(program.ensure_editable().is_err());

        let next = program.next_version();
        assert_eq!(next.version, 4);
        assert_eq!(next.status, ProgramStatus::Draft);
        assert!(next.ensure_editable().is_ok());

        program.archive();
        assert!(!program.is_executable());
        assert!(program.publish().is_err());
    }

    #[test]
    fn entry_capable_triggers() {
        assert!(TriggerType::Immediate.is_entry_capable());
        assert!(TriggerType::UserAction.is_entry_capable());
        assert!(TriggerType::TimeBased.is_entry_capable());
        assert!(!TriggerType::ConditionBased.is_entry_capable());
        assert!(!TriggerType::Delayed.is_entry_capable());
    }
}
