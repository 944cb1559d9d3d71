use super::{types::Config, ConfigError};

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

fn check_percent(name: &str, value: f32) -> Result<(), ConfigError> {
    if !(value > 0.0 && value <= 100.0) {
        return Err(invalid(format!("{} must be in (0, 100], got {}", name, value)));
    }
    Ok(())
}

/// Validate configuration
/// Currently validates:
/// - Pool sizes and memory ceilings are usable
/// - Intervals and retry budgets are non-zero
/// - Provider URL is http(s)
/// - Server port is not 0 when the status server is enabled
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let admission = &config.admission;
    if admission.max_preparation == 0 {
        return Err(invalid("admission.max_preparation must be at least 1"));
    }
    if admission.max_watch == 0 {
        return Err(invalid("admission.max_watch must be at least 1"));
    }
    check_percent("admission.max_memory_percent", admission.max_memory_percent)?;
    if let Some(watch) = admission.watch_memory_percent {
        check_percent("admission.watch_memory_percent", watch)?;
    }

    let orchestrator = &config.orchestrator;
    if orchestrator.tick_interval_ms == 0 {
        return Err(invalid("orchestrator.tick_interval_ms cannot be 0"));
    }
    if orchestrator.session_close_timeout_ms == 0 {
        return Err(invalid("orchestrator.session_close_timeout_ms cannot be 0"));
    }
    if orchestrator.preparation.max_attempts == 0 {
        return Err(invalid("orchestrator.preparation.max_attempts must be at least 1"));
    }
    if orchestrator.preparation.backoff_multiplier < 1.0 {
        return Err(invalid("orchestrator.preparation.backoff_multiplier must be >= 1.0"));
    }
    if orchestrator.watch.poll_interval_ms == 0 {
        return Err(invalid("orchestrator.watch.poll_interval_ms cannot be 0"));
    }
    if orchestrator.watch.max_consecutive_failures == 0 {
        return Err(invalid(
            "orchestrator.watch.max_consecutive_failures must be at least 1",
        ));
    }
    if orchestrator.watch.backoff_multiplier < 1.0 {
        return Err(invalid("orchestrator.watch.backoff_multiplier must be >= 1.0"));
    }
    if orchestrator.persistence.max_attempts == 0 {
        return Err(invalid("orchestrator.persistence.max_attempts must be at least 1"));
    }

    let base_url = config.provider.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(invalid(format!(
            "provider.base_url must be an http(s) URL, got '{}'",
            base_url
        )));
    }
    if config.provider.timeout_secs == 0 {
        return Err(invalid("provider.timeout_secs cannot be 0"));
    }

    if config.server.enabled && config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_pool_fails() {
        let mut config = Config::default();
        config.admission.max_watch = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_memory_ceiling_range() {
        let mut config = Config::default();
        config.admission.max_memory_percent = 120.0;
        assert!(validate_config(&config).is_err());

        config.admission.max_memory_percent = 100.0;
        config.admission.watch_memory_percent = Some(0.0);
        assert!(validate_config(&config).is_err());

        config.admission.watch_memory_percent = Some(95.0);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_failure_budget() {
        let mut config = Config::default();
        config.orchestrator.watch.max_consecutive_failures = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_close_timeout_fails() {
        let mut config = Config::default();
        config.orchestrator.session_close_timeout_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_provider_url() {
        let mut config = Config::default();
        config.provider.base_url = "ftp://odds".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_port_zero_only_when_enabled() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(validate_config(&config).is_ok());

        config.server.enabled = true;
        let err = validate_config(&config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration validation failed: server.port cannot be 0"
        );
    }
}
