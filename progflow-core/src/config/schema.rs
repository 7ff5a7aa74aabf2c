use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub execution: ExecutionSettings,
    pub expressions: ExpressionSettings,
    pub recorder: RecorderSettings,
    pub knowledge: KnowledgeSettings,
    pub http: HttpSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Upper bound on any program's `parallel_limit`.
    pub parallel_hard_limit: usize,
    pub retry_backoff_multiplier: f64,
    pub retry_backoff_max_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            parallel_hard_limit: 16,
            retry_backoff_multiplier: 2.0,
            retry_backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExpressionSettings {
    pub max_length: usize,
    pub max_depth: usize,
}

impl Default for ExpressionSettings {
    fn default() -> Self {
        Self {
            max_length: 8_192,
            max_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderSettings {
    pub max_retained_runs: usize,
    pub trace_file: Option<PathBuf>,
    pub event_buffer: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_retained_runs: 1_000,
            trace_file: None,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeSettings {
    pub limit: usize,
    pub threshold: f32,
}

impl Default for KnowledgeSettings {
    fn default() -> Self {
        Self {
            limit: 5,
            threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_seconds: u64,
    pub user_agent: String,
    pub max_response_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: format!("progflow/{}", env!("CARGO_PKG_VERSION")),
            max_response_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}
