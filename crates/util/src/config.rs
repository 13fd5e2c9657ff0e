use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::server_bind_address;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Where idempotency records and dead letters are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite(String),
    Memory,
}

/// Inputs for signature verification and event identity resolution.
#[derive(Clone)]
pub struct WebhookSettings {
    pub secret: Vec<u8>,
    pub event_id_pointer: String,
    pub event_type_pointer: String,
}

impl fmt::Debug for WebhookSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSettings")
            .field("secret", &"<redacted>")
            .field("event_id_pointer", &self.event_id_pointer)
            .field("event_type_pointer", &self.event_type_pointer)
            .finish()
    }
}

/// Worker, retry and timeout knobs for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
    pub attempt_timeout: Duration,
    pub forward_url: Option<String>,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub webhook: WebhookSettings,
    pub storage: StorageBackend,
    pub queue_capacity: usize,
    pub dispatch: DispatchSettings,
    pub retention: Duration,
    pub maintenance_interval: Duration,
    pub shutdown_grace: Duration,
}

pub const DEFAULT_DATABASE_URL: &str = "sqlite://hookrelay.db?mode=rwc";

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let secret = env::var("WEBHOOK_SECRET")
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::Missing("WEBHOOK_SECRET"))?;
        let webhook = WebhookSettings {
            secret: secret.into_bytes(),
            event_id_pointer: pointer_var("WEBHOOK_EVENT_ID_POINTER", "/id")?,
            event_type_pointer: pointer_var("WEBHOOK_EVENT_TYPE_POINTER", "/event")?,
        };

        let storage = match env::var("DATABASE_URL") {
            Ok(value) if value == "memory" => StorageBackend::Memory,
            Ok(value) if !value.is_empty() => StorageBackend::Sqlite(value),
            _ => StorageBackend::Sqlite(DEFAULT_DATABASE_URL.to_string()),
        };

        let queue_capacity = positive("QUEUE_CAPACITY", parse_var("QUEUE_CAPACITY", 1024usize)?)?;

        let base_delay = Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", 500u64)?);
        let max_delay = Duration::from_millis(parse_var("RETRY_MAX_DELAY_MS", 60_000u64)?);
        if max_delay < base_delay {
            return Err(ConfigError::InvalidValue {
                name: "RETRY_MAX_DELAY_MS",
                value: max_delay.as_millis().to_string(),
            });
        }
        let jitter: f64 = parse_var("RETRY_JITTER", 0.2f64)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidValue {
                name: "RETRY_JITTER",
                value: jitter.to_string(),
            });
        }

        let dispatch = DispatchSettings {
            workers: positive("DISPATCH_WORKERS", parse_var("DISPATCH_WORKERS", 4usize)?)?,
            max_attempts: positive("RETRY_MAX_ATTEMPTS", parse_var("RETRY_MAX_ATTEMPTS", 5u32)?)?,
            base_delay,
            max_delay,
            jitter,
            attempt_timeout: Duration::from_millis(positive(
                "HANDLER_TIMEOUT_MS",
                parse_var("HANDLER_TIMEOUT_MS", 10_000u64)?,
            )?),
            forward_url: env::var("HANDLER_FORWARD_URL")
                .ok()
                .filter(|value| !value.is_empty()),
        };

        Ok(Self {
            bind_addr,
            environment,
            webhook,
            storage,
            queue_capacity,
            dispatch,
            retention: Duration::from_secs(positive(
                "IDEMPOTENCY_RETENTION_SECS",
                parse_var("IDEMPOTENCY_RETENTION_SECS", 72 * 3600u64)?,
            )?),
            maintenance_interval: Duration::from_secs(positive(
                "MAINTENANCE_INTERVAL_SECS",
                parse_var("MAINTENANCE_INTERVAL_SECS", 60u64)?,
            )?),
            shutdown_grace: Duration::from_secs(parse_var("SHUTDOWN_GRACE_SECS", 10u64)?),
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value: raw })
        }
        _ => Ok(default),
    }
}

fn positive<T>(name: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default + ToString,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        })
    }
}

fn pointer_var(name: &'static str, default: &str) -> Result<String, ConfigError> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    if value.is_empty() || value.starts_with('/') {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue { name, value })
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set to a non-empty value"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_BIND_ADDR, ENV_GUARD};

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "WEBHOOK_SECRET",
        "WEBHOOK_EVENT_ID_POINTER",
        "WEBHOOK_EVENT_TYPE_POINTER",
        "DATABASE_URL",
        "QUEUE_CAPACITY",
        "DISPATCH_WORKERS",
        "RETRY_MAX_ATTEMPTS",
        "RETRY_BASE_DELAY_MS",
        "RETRY_MAX_DELAY_MS",
        "RETRY_JITTER",
        "HANDLER_TIMEOUT_MS",
        "HANDLER_FORWARD_URL",
        "IDEMPOTENCY_RETENTION_SECS",
        "MAINTENANCE_INTERVAL_SECS",
        "SHUTDOWN_GRACE_SECS",
    ];

    fn clear_env() {
        for name in VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("WEBHOOK_SECRET", "s3cret");

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.webhook.secret, b"s3cret");
        assert_eq!(config.webhook.event_id_pointer, "/id");
        assert_eq!(
            config.storage,
            StorageBackend::Sqlite(DEFAULT_DATABASE_URL.to_string())
        );
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.dispatch.base_delay, Duration::from_millis(500));
        assert!(config.dispatch.forward_url.is_none());
        assert_eq!(config.retention, Duration::from_secs(72 * 3600));

        clear_env();
    }

    #[test]
    fn requires_webhook_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(err, ConfigError::Missing("WEBHOOK_SECRET")));
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn parses_production_overrides() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "127.0.0.1:9000");
        env::set_var("WEBHOOK_SECRET", "s3cret");
        env::set_var("DATABASE_URL", "memory");
        env::set_var("QUEUE_CAPACITY", "8");
        env::set_var("RETRY_MAX_ATTEMPTS", "3");
        env::set_var("HANDLER_FORWARD_URL", "http://localhost:9999/events");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(
            config.dispatch.forward_url.as_deref(),
            Some("http://localhost:9999/events")
        );

        clear_env();
    }

    #[test]
    fn rejects_zero_capacity_and_bad_jitter() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("WEBHOOK_SECRET", "s3cret");
        env::set_var("QUEUE_CAPACITY", "0");

        let err = AppConfig::from_env().expect_err("zero capacity should error");
        assert!(matches!(err, ConfigError::InvalidValue { name: "QUEUE_CAPACITY", .. }));

        env::set_var("QUEUE_CAPACITY", "16");
        env::set_var("RETRY_JITTER", "1.5");
        let err = AppConfig::from_env().expect_err("jitter above 1 should error");
        assert!(matches!(err, ConfigError::InvalidValue { name: "RETRY_JITTER", .. }));

        clear_env();
    }

    #[test]
    fn debug_output_redacts_secret() {
        let settings = WebhookSettings {
            secret: b"hunter2".to_vec(),
            event_id_pointer: "/id".to_string(),
            event_type_pointer: "/event".to_string(),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
