pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{apply_env_overrides, load, load_from_file, load_from_str};
pub use schema::{
    EngineConfig, ExecutionSettings, ExpressionSettings, HttpSettings, KnowledgeSettings,
    LogFormat, LoggingConfig, RecorderSettings,
};
pub use validation::validate_config;
