//! Post-parse configuration validation.
//!
//! Anything that fails here is startup-fatal; the process must not come up
//! half-configured.

use super::{Config, ConfigError, StoreBackend};

/// Validate a parsed configuration.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.generator.default_model.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "generator.default_model must be set".into(),
        ));
    }
    if config.generator.timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "generator.timeout_secs must be positive".into(),
        ));
    }

    if config.chat.channels.is_empty() {
        return Err(ConfigError::Invalid(
            "chat.channels must list at least one channel".into(),
        ));
    }
    if config.chat.client_id.trim().is_empty() || config.chat.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "chat.client_id and chat.client_secret must be set".into(),
        ));
    }

    if config.store.backend == StoreBackend::Postgres {
        if config.store.url.is_none() {
            return Err(ConfigError::Invalid(
                "store.url is required for the postgres backend".into(),
            ));
        }
        // Networked store never holds plaintext tokens.
        if config.security.token_encryption_key.is_none() {
            return Err(ConfigError::Invalid(
                "security.token_encryption_key is required for the postgres backend".into(),
            ));
        }
    }

    if config.limits.mailbox_depth == 0 {
        return Err(ConfigError::Invalid(
            "limits.mailbox_depth must be positive".into(),
        ));
    }

    match config.log.format.as_str() {
        "console" | "json" => {}
        other => {
            return Err(ConfigError::Invalid(format!(
                "log.format must be 'console' or 'json', got '{other}'"
            )));
        }
    }
    match config.log.level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => {
            return Err(ConfigError::Invalid(format!(
                "log.level must be one of trace/debug/info/warn/error, got '{other}'"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        toml::from_str(
            r##"
            [generator]
            default_model = "llama3.2"

            [chat]
            client_id = "abc"
            client_secret = "def"
            channels = ["#somechan"]
            "##,
        )
        .unwrap()
    }

    #[test]
    fn minimal_config_validates() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn empty_channel_list_is_rejected() {
        let mut config = base();
        config.chat.channels.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn postgres_requires_url_and_key() {
        let mut config = base();
        config.store.backend = StoreBackend::Postgres;
        assert!(validate(&config).is_err());

        config.store.url = Some("postgres://c@localhost/clank".into());
        assert!(validate(&config).is_err());

        config.security.token_encryption_key = Some("a".repeat(44));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn bad_log_format_is_rejected() {
        let mut config = base();
        config.log.format = "xml".into();
        assert!(validate(&config).is_err());
    }
}
