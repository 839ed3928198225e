use chatstream_core::backoff::{
    BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
};
use std::{fmt, str::FromStr, time::Duration};
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which transport the session talks to the query service over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Duplex,
    Push,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "duplex" | "ws" | "websocket" => Ok(TransportKind::Duplex),
            "push" | "http" | "sse" => Ok(TransportKind::Push),
            other => Err(format!("'{other}' is not a transport (expected duplex or push)")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Duplex => f.write_str("duplex"),
            TransportKind::Push => f.write_str("push"),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub transport: TransportKind,
    pub ws_url: Option<String>,
    pub http_url: Option<String>,
    pub caller_id: String,
    pub database_url: String,
    pub backoff: BackoffPolicy,
    pub log_level: Level,
}

impl Config {
    /// Loads and validates configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::load()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the environment without checking that the chosen transport has
    /// an endpoint. Call [`Config::validate`] once overrides are applied.
    pub fn load() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let transport = match std::env::var("CHATSTREAM_TRANSPORT") {
            Ok(raw) => raw
                .parse::<TransportKind>()
                .map_err(|e| ConfigError::InvalidValue("CHATSTREAM_TRANSPORT".to_string(), e))?,
            Err(_) => TransportKind::default(),
        };

        let ws_url = std::env::var("CHATSTREAM_WS_URL").ok();
        let http_url = std::env::var("CHATSTREAM_HTTP_URL").ok();

        let caller_id =
            std::env::var("CHATSTREAM_CALLER_ID").unwrap_or_else(|_| "anonymous".to_string());
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://chatstream.db".to_string());

        let backoff = BackoffPolicy {
            base_delay: duration_ms_var("RECONNECT_BASE_MS", DEFAULT_BASE_DELAY)?,
            max_delay: duration_ms_var("RECONNECT_MAX_MS", DEFAULT_MAX_DELAY)?,
            max_attempts: parse_var("RECONNECT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
        };
        if backoff.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "RECONNECT_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            transport,
            ws_url,
            http_url,
            caller_id,
            database_url,
            backoff,
            log_level,
        })
    }

    /// Checks that the selected transport has its endpoint configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.transport {
            TransportKind::Duplex if self.ws_url.is_none() => Err(ConfigError::MissingVar(
                "CHATSTREAM_WS_URL must be set for the 'duplex' transport".to_string(),
            )),
            TransportKind::Push if self.http_url.is_none() => Err(ConfigError::MissingVar(
                "CHATSTREAM_HTTP_URL must be set for the 'push' transport".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(name.to_string(), format!("'{raw}' is not a number"))
        }),
        Err(_) => Ok(default),
    }
}

fn duration_ms_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(_) => parse_var::<u64>(name, 0).map(Duration::from_millis),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("CHATSTREAM_TRANSPORT");
            env::remove_var("CHATSTREAM_WS_URL");
            env::remove_var("CHATSTREAM_HTTP_URL");
            env::remove_var("CHATSTREAM_CALLER_ID");
            env::remove_var("DATABASE_URL");
            env::remove_var("RECONNECT_BASE_MS");
            env::remove_var("RECONNECT_MAX_MS");
            env::remove_var("RECONNECT_MAX_ATTEMPTS");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("DUPLEX".parse::<TransportKind>(), Ok(TransportKind::Duplex));
        assert_eq!("sse".parse::<TransportKind>(), Ok(TransportKind::Push));
        assert!("pigeon".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Push.to_string(), "push");
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal_duplex() {
        clear_env_vars();
        unsafe {
            env::set_var("CHATSTREAM_WS_URL", "ws://localhost:8000/chat");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.transport, TransportKind::Duplex);
        assert_eq!(config.ws_url.as_deref(), Some("ws://localhost:8000/chat"));
        assert_eq!(config.http_url, None);
        assert_eq!(config.caller_id, "anonymous");
        assert_eq!(config.database_url, "sqlite://chatstream.db");
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("CHATSTREAM_TRANSPORT", "push");
            env::set_var("CHATSTREAM_HTTP_URL", "http://localhost:8000/ask");
            env::set_var("CHATSTREAM_CALLER_ID", "ada");
            env::set_var("DATABASE_URL", "sqlite::memory:");
            env::set_var("RECONNECT_BASE_MS", "250");
            env::set_var("RECONNECT_MAX_MS", "4000");
            env::set_var("RECONNECT_MAX_ATTEMPTS", "3");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.transport, TransportKind::Push);
        assert_eq!(config.http_url.as_deref(), Some("http://localhost:8000/ask"));
        assert_eq!(config.caller_id, "ada");
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.backoff.base_delay, Duration::from_millis(250));
        assert_eq!(config.backoff.max_delay, Duration::from_millis(4000));
        assert_eq!(config.backoff.max_attempts, 3);
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_ws_url() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("CHATSTREAM_WS_URL")),
            _ => panic!("Expected MissingVar for CHATSTREAM_WS_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_http_url_for_push() {
        clear_env_vars();
        unsafe {
            env::set_var("CHATSTREAM_TRANSPORT", "push");
            env::set_var("CHATSTREAM_WS_URL", "ws://localhost:8000/chat");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("CHATSTREAM_HTTP_URL")),
            _ => panic!("Expected MissingVar for CHATSTREAM_HTTP_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_transport() {
        clear_env_vars();
        unsafe {
            env::set_var("CHATSTREAM_TRANSPORT", "carrier-pigeon");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "CHATSTREAM_TRANSPORT"),
            _ => panic!("Expected InvalidValue for CHATSTREAM_TRANSPORT"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_backoff_values() {
        clear_env_vars();
        unsafe {
            env::set_var("CHATSTREAM_WS_URL", "ws://localhost:8000/chat");
            env::set_var("RECONNECT_BASE_MS", "soon");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RECONNECT_BASE_MS"),
            _ => panic!("Expected InvalidValue for RECONNECT_BASE_MS"),
        }

        unsafe {
            env::remove_var("RECONNECT_BASE_MS");
            env::set_var("RECONNECT_MAX_ATTEMPTS", "0");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RECONNECT_MAX_ATTEMPTS"),
            _ => panic!("Expected InvalidValue for RECONNECT_MAX_ATTEMPTS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("CHATSTREAM_WS_URL", "ws://localhost:8000/chat");
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    #[serial]
    fn test_load_skips_endpoint_validation() {
        clear_env_vars();
        let config = Config::load().expect("load does not validate endpoints");
        assert!(config.validate().is_err());
    }
}
