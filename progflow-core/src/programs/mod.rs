pub mod catalog;
pub mod dispatcher;
pub mod executor;
pub mod expressions;
pub mod handlers;
pub mod loader;
pub mod registry;
pub mod run;
pub mod template;
pub mod types;
pub mod validation;

pub use catalog::ProgramCatalog;
pub use dispatcher::{RunScope, StepDispatcher};
pub use executor::ProgramExecutor;
pub use expressions::{Environment, EvaluationOptions, Expression, ExpressionError, ExpressionEvaluator};
pub use handlers::BuiltinServices;
pub use loader::ProgramLoader;
pub use registry::{
    ActionHandler, ActionInvocation, HandlerError, HandlerRegistry, StepHandler, TriggerContext,
    TriggerHandler,
};
pub use run::{
    FailureReason, RunContext, RunRequest, RunResult, RunStatus, StepError, StepErrorKind,
    StepResult, StepStatus, TriggerDecision,
};
pub use types::{
    ActionConfig, ActionType, AnalyticsConfig, ExecutionConfig, ExecutionStrategy, Program,
    ProgramStatus, Step, StepType, TriggerConfig, TriggerType,
};
pub use validation::{validate_program, IssueKind, Severity, StepGraph, ValidationIssue};
