use crate::programs::registry::StepHandler;
use crate::programs::types::{ActionType, Step, StepType, TriggerType};

/// Structural rules for the built-in step types. Custom action types are
/// always accepted; built-in ones must suit the step type.
#[derive(Debug, Clone)]
pub struct BuiltinStepHandler {
    step_type: StepType,
}

impl BuiltinStepHandler {
    pub fn new(step_type: StepType) -> Self {
        Self { step_type }
    }

    fn expected_action(&self) -> Option<ActionType> {
        match self.step_type {
            StepType::Message => Some(ActionType::SendMessage),
            StepType::Task => Some(ActionType::AssignTask),
            StepType::Survey => Some(ActionType::SendSurvey),
            StepType::Wait => Some(ActionType::Wait),
            _ => None,
        }
    }
}

impl StepHandler for BuiltinStepHandler {
    fn validate(&self, step: &Step) -> Vec<String> {
        let mut issues = Vec::new();
        let action = &step.action.action_type;
        let trigger = &step.trigger.trigger_type;

        if let Some(expected) = self.expected_action() {
            let waits_by_trigger =
                self.step_type == StepType::Wait && *trigger == TriggerType::Delayed;
            if action.is_builtin() && *action != expected && !waits_by_trigger {
                issues.push(format!(
                    "{} step expects a '{expected}' action, found '{action}'",
                    self.step_type
                ));
            }
        }

        match self.step_type {
            StepType::Condition if *trigger != TriggerType::ConditionBased => {
                issues.push(format!(
                    "condition step needs a condition_based trigger, found '{trigger}'"
                ));
            }
            StepType::Trigger if *trigger == TriggerType::Immediate => {
                issues.push(
                    "trigger step needs an external trigger (time_based, user_action or delayed)"
                        .to_owned(),
                );
            }
            _ => {}
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::types::TriggerConfig;

    #[test]
    fn message_step_rejects_other_builtin_actions() {
        let handler = BuiltinStepHandler::new(StepType::Message);
        let step = Step::new("m", StepType::Message, ActionType::AssignTask);
        assert_eq!(handler.validate(&step).len(), 1);

        let custom = Step::new("m", StepType::Message, ActionType::from("push_notification"));
        assert!(handler.validate(&custom).is_empty());
    }

    #[test]
    fn condition_step_needs_condition_trigger() {
        let handler = BuiltinStepHandler::new(StepType::Condition);
        let bare = Step::new("c", StepType::Condition, ActionType::SendMessage);
        assert_eq!(handler.validate(&bare).len(), 1);

        let ok = bare.with_trigger(TriggerConfig::condition("x > 1"));
        assert!(handler.validate(&ok).is_empty());
    }

    #[test]
    fn wait_step_may_wait_through_its_trigger() {
        let handler = BuiltinStepHandler::new(StepType::Wait);
        let step = Step::new("w", StepType::Wait, ActionType::SendMessage)
            .with_trigger(TriggerConfig::delayed(5));
        assert!(handler.validate(&step).is_empty());
    }
}
