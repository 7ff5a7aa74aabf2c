use crate::config::schema::EngineConfig;
use crate::error::{Error, Result};

pub fn validate_config(config: &EngineConfig) -> Result<()> {
    if config.execution.parallel_hard_limit == 0 {
        return Err(Error::Validation(
            "execution.parallel_hard_limit must be at least 1".to_owned(),
        ));
    }

    let multiplier = config.execution.retry_backoff_multiplier;
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(Error::Validation(format!(
            "execution.retry_backoff_multiplier must be >= 1.0, got {multiplier}"
        )));
    }

    if config.expressions.max_length == 0 || config.expressions.max_depth == 0 {
        return Err(Error::Validation(
            "expressions.max_length and expressions.max_depth must be positive".to_owned(),
        ));
    }

    if config.recorder.max_retained_runs == 0 {
        return Err(Error::Validation(
            "recorder.max_retained_runs must be at least 1".to_owned(),
        ));
    }

    if !(0.0..=1.0).contains(&config.knowledge.threshold) {
        return Err(Error::Validation(format!(
            "knowledge.threshold must be within [0, 1], got {}",
            config.knowledge.threshold
        )));
    }

    if config.http.timeout_seconds == 0 {
        return Err(Error::Validation(
            "http.timeout_seconds must be greater than zero".to_owned(),
        ));
    }

    if config.logging.level.trim().is_empty() {
        return Err(Error::Validation("logging.level cannot be empty".to_owned()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::validate_config;
    use crate::config::schema::EngineConfig;

    #[test]
    fn accepts_default_config() {
        assert!(validate_config(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn rejects_zero_parallel_limit() {
        let mut config = EngineConfig::default();
        config.execution.parallel_hard_limit = 0;

        let error = validate_config(&config).expect_err("validation should fail");
        assert!(error.to_string().contains("parallel_hard_limit"));
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let mut config = EngineConfig::default();
        config.execution.retry_backoff_multiplier = 0.5;
        assert!(validate_config(&config).is_err());
    }
}
