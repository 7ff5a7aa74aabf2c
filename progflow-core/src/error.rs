use thiserror::Error;

use crate::programs::expressions::ExpressionError;
use crate::programs::validation::ValidationIssue;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("program '{program_id}' has {} blocking validation issue(s)", .issues.len())]
    InvalidProgram {
        program_id: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("{kind} handler '{type_id}' is already registered")]
    DuplicateHandler { kind: HandlerKind, type_id: String },

    #[error("no {kind} handler registered for '{type_id}'")]
    UnknownHandler { kind: HandlerKind, type_id: String },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("run task failed: {0}")]
    Task(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Step,
    Trigger,
    Action,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Step => "step",
            HandlerKind::Trigger => "trigger",
            HandlerKind::Action => "action",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
