use std::path::{Path, PathBuf};

use crate::config::schema::{EngineConfig, LogFormat};
use crate::config::validation::validate_config;
use crate::error::{Error, Result};

pub const ENV_LOG_LEVEL: &str = "PROGFLOW_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "PROGFLOW_LOG_FORMAT";
pub const ENV_PARALLEL_HARD_LIMIT: &str = "PROGFLOW_PARALLEL_HARD_LIMIT";
pub const ENV_TRACE_FILE: &str = "PROGFLOW_TRACE_FILE";

pub fn load_from_file(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        Error::Config(format!("failed to read config '{}': {err}", path.display()))
    })?;

    load_from_str(&content).map_err(|err| match err {
        Error::Config(message) => {
            Error::Config(format!("failed to parse config '{}': {message}", path.display()))
        }
        other => other,
    })
}

pub fn load_from_str(content: &str) -> Result<EngineConfig> {
    toml::from_str(content).map_err(|err| Error::Config(err.to_string()))
}

/// Applies `PROGFLOW_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
        config.logging.level = level.trim().to_owned();
    }

    if let Some(format) = lookup(ENV_LOG_FORMAT) {
        config.logging.format = match format.trim().to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(Error::Config(format!(
                    "{ENV_LOG_FORMAT} must be 'text' or 'json', got '{other}'"
                )))
            }
        };
    }

    if let Some(limit) = lookup(ENV_PARALLEL_HARD_LIMIT) {
        config.execution.parallel_hard_limit = limit.trim().parse().map_err(|err| {
            Error::Config(format!(
                "{ENV_PARALLEL_HARD_LIMIT} must be a positive integer: {err}"
            ))
        })?;
    }

    if let Some(path) = lookup(ENV_TRACE_FILE).filter(|v| !v.trim().is_empty()) {
        config.recorder.trace_file = Some(PathBuf::from(path.trim()));
    }

    Ok(())
}

/// File (when given), then process environment, then validation.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => load_from_file(path)?,
        None => EngineConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = load_from_str(
            r#"
            [execution]
            parallel_hard_limit = 4

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.execution.parallel_hard_limit, 4);
        assert_eq!(config.execution.retry_backoff_multiplier, 2.0);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.expressions.max_depth, 64);
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = load_from_str("[logging]\nlevel = \"warn\"\n").unwrap();
        let env = HashMap::from([
            (ENV_LOG_LEVEL, "debug"),
            (ENV_PARALLEL_HARD_LIMIT, "3"),
            (ENV_TRACE_FILE, "/tmp/progflow.jsonl"),
        ]);

        apply_env_overrides(&mut config, |key| env.get(key).map(|v| (*v).to_owned())).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.execution.parallel_hard_limit, 3);
        assert_eq!(
            config.recorder.trace_file,
            Some(PathBuf::from("/tmp/progflow.jsonl"))
        );
    }

    #[test]
    fn rejects_bad_env_values() {
        let mut config = EngineConfig::default();
        let err = apply_env_overrides(&mut config, |key| {
            (key == ENV_LOG_FORMAT).then(|| "xml".to_owned())
        })
        .unwrap_err();
        assert!(err.to_string().contains("PROGFLOW_LOG_FORMAT"));
    }

    #[test]
    fn load_from_file_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[execution\nparallel_hard_limit = 1").unwrap();

        let err = load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }
}
