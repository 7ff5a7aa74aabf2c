pub mod actions;
pub mod http;
pub mod steps;
pub mod triggers;

use std::sync::Arc;

use crate::config::HttpSettings;
use crate::error::Result;
use crate::integrations::{NoopPersonalityProvider, PersonalityProvider};
use crate::programs::registry::HandlerRegistry;
use crate::programs::types::{ActionType, StepType, TriggerType};

pub use actions::{AssignTaskAction, SendMessageAction, SendSurveyAction, WaitAction};
pub use http::CallExternalAction;
pub use steps::BuiltinStepHandler;
pub use triggers::{
    ConditionTrigger, DelayedTrigger, ImmediateTrigger, TimeBasedTrigger, UserActionTrigger,
};

/// Collaborators the built-in handlers are constructed with.
#[derive(Clone)]
pub struct BuiltinServices {
    pub personality: Arc<dyn PersonalityProvider>,
    pub http: HttpSettings,
}

impl Default for BuiltinServices {
    fn default() -> Self {
        Self {
            personality: Arc::new(NoopPersonalityProvider),
            http: HttpSettings::default(),
        }
    }
}

impl HandlerRegistry {
    /// Registry holding every built-in step, trigger and action type.
    pub fn builtin(services: BuiltinServices) -> Result<Self> {
        let mut registry = HandlerRegistry::new();

        for step_type in [
            StepType::Message,
            StepType::Task,
            StepType::Survey,
            StepType::Wait,
            StepType::Condition,
            StepType::Trigger,
        ] {
            let type_id = step_type.as_str().to_owned();
            registry.register_step(&type_id, Arc::new(BuiltinStepHandler::new(step_type)))?;
        }

        registry.register_trigger(TriggerType::Immediate.as_str(), Arc::new(ImmediateTrigger))?;
        registry.register_trigger(TriggerType::ConditionBased.as_str(), Arc::new(ConditionTrigger))?;
        registry.register_trigger(TriggerType::TimeBased.as_str(), Arc::new(TimeBasedTrigger))?;
        registry.register_trigger(TriggerType::UserAction.as_str(), Arc::new(UserActionTrigger))?;
        registry.register_trigger(TriggerType::Delayed.as_str(), Arc::new(DelayedTrigger))?;

        registry.register_action(
            ActionType::SendMessage.as_str(),
            Arc::new(SendMessageAction::new(services.personality.clone())),
        )?;
        registry.register_action(ActionType::AssignTask.as_str(), Arc::new(AssignTaskAction))?;
        registry.register_action(ActionType::SendSurvey.as_str(), Arc::new(SendSurveyAction))?;
        registry.register_action(ActionType::Wait.as_str(), Arc::new(WaitAction))?;
        registry.register_action(
            ActionType::CallExternal.as_str(),
            Arc::new(CallExternalAction::new(services.http)),
        )?;

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerKind;

    #[test]
    fn builtin_registry_covers_every_builtin_type() {
        let registry = HandlerRegistry::builtin(BuiltinServices::default()).unwrap();
        assert_eq!(registry.list(HandlerKind::Step).len(), StepType::BUILTIN.len());
        assert_eq!(registry.list(HandlerKind::Trigger).len(), TriggerType::BUILTIN.len());
        assert_eq!(registry.list(HandlerKind::Action).len(), ActionType::BUILTIN.len());
        for id in ActionType::BUILTIN {
            assert!(registry.contains(HandlerKind::Action, id));
        }
    }
}
