//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{
    DispatcherConfig, LogFormat, LogOutput, LoggingConfig, PersistenceBackend, PersistenceConfig,
    SwitchboardConfig,
};

/// Validates the entire configuration.
pub fn validate_config(config: &SwitchboardConfig) -> ConfigResult<()> {
    validate_dispatcher_config(&config.dispatcher)?;
    validate_persistence_config(&config.persistence)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

fn validate_dispatcher_config(dispatcher: &DispatcherConfig) -> ConfigResult<()> {
    if dispatcher.workers == 0 {
        return Err(ConfigError::validation(
            "dispatcher.workers must be greater than 0",
        ));
    }

    if dispatcher.queue_capacity == Some(0) {
        return Err(ConfigError::validation(
            "dispatcher.queue_capacity must be greater than 0; omit it for an unbounded queue",
        ));
    }

    Ok(())
}

fn validate_persistence_config(persistence: &PersistenceConfig) -> ConfigResult<()> {
    match persistence.backend {
        PersistenceBackend::File => match &persistence.path {
            None => return Err(ConfigError::missing_field("persistence.path")),
            Some(path) if path.as_os_str().is_empty() => {
                return Err(ConfigError::validation("persistence.path cannot be empty"));
            }
            Some(_) => {}
        },
        PersistenceBackend::None | PersistenceBackend::Memory => {
            if persistence.on_flush {
                return Err(ConfigError::validation(
                    "persistence.on_flush only applies to the file backend",
                ));
            }
        }
    }

    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }

    if logging.format == LogFormat::Json && !cfg!(feature = "json-log") {
        return Err(ConfigError::validation(
            "logging.format = \"json\" requires the json-log feature",
        ));
    }

    if let Some(target) = logging
        .filters
        .keys()
        .find(|target| target.is_empty() || target.contains([' ', '=', ',']))
    {
        return Err(ConfigError::validation(format!(
            "Invalid logging filter target: {target:?}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_is_valid() {
        assert!(validate_config(&SwitchboardConfig::default()).is_ok());
    }

    #[test]
    fn test_file_backend_needs_path() {
        let mut config = SwitchboardConfig::default();
        config.persistence.backend = PersistenceBackend::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));

        config.persistence.path = Some(PathBuf::from("state.json"));
        config.persistence.on_flush = true;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_on_flush_without_file_backend() {
        let mut config = SwitchboardConfig::default();
        config.persistence.backend = PersistenceBackend::Memory;
        config.persistence.on_flush = true;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_dispatcher_bounds() {
        let mut config = SwitchboardConfig::default();
        config.dispatcher.queue_capacity = Some(0);
        assert!(validate_config(&config).is_err());

        config.dispatcher.queue_capacity = Some(1);
        config.dispatcher.flush_interval_secs = 0;
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.dispatcher.flush_interval(), None);
    }

    #[test]
    fn test_logging_rules() {
        let mut config = SwitchboardConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());

        config.logging.file_path = Some(PathBuf::from("logs/bot.log"));
        assert!(validate_config(&config).is_ok());

        config
            .logging
            .filters
            .insert("bad target".into(), Default::default());
        assert!(validate_config(&config).is_err());
    }
}
