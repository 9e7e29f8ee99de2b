use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::sp_api::EndpointCategory;
use std::{collections::BTreeSet, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

pub const DEFAULT_MARKETPLACE_ID: &str = "A1F83G8C2ARO7P";
pub const DEFAULT_TOKEN_URL: &str = "https://api.amazon.com/auth/o2/token";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub resilience: ResilienceSettings,
    pub cleanup: CleanupSettings,
}

#[derive(Clone)]
pub struct Credentials {
    pub lwa_client_id: String,
    pub lwa_client_secret: String,
    pub lwa_refresh_token: String,
    pub seller_id: String,
    pub marketplace_id: String,
    /// Overrides the regional endpoint derived from `marketplace_id`.
    pub endpoint: Option<String>,
    pub token_url: String,
}

// Secrets stay out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("lwa_client_id", &self.lwa_client_id)
            .field("seller_id", &self.seller_id)
            .field("marketplace_id", &self.marketplace_id)
            .field("endpoint", &self.endpoint)
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ResilienceSettings {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub read_timeout: Duration,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_error_rate_threshold: f64,
    pub circuit_breaker_recovery_timeout: Duration,
    pub circuit_breaker_exempt: BTreeSet<EndpointCategory>,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            max_connections: 20,
            connection_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            circuit_breaker_failure_threshold: 50,
            circuit_breaker_error_rate_threshold: 0.5,
            circuit_breaker_recovery_timeout: Duration::from_secs(60),
            circuit_breaker_exempt: BTreeSet::from([EndpointCategory::Inventory]),
        }
    }
}

impl ResilienceSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            error_rate_threshold: self.circuit_breaker_error_rate_threshold,
            recovery_timeout: self.circuit_breaker_recovery_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub dry_run: bool,
    pub age_threshold_days: i64,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub cooldown_window: Duration,
    pub skip_list: BTreeSet<String>,
    pub test_mode: bool,
    pub test_sample_size: usize,
    pub test_seed_skus: Vec<String>,
    pub ledger_path: PathBuf,
    pub report_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            dry_run: true,
            age_threshold_days: 30,
            batch_size: 100,
            batch_pause: Duration::from_millis(500),
            cooldown_window: Duration::from_secs(60 * 60),
            skip_list: BTreeSet::new(),
            test_mode: false,
            test_sample_size: 10,
            test_seed_skus: Vec::new(),
            ledger_path: PathBuf::from("logs/processed_skus.json"),
            report_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let credentials = Credentials {
            lwa_client_id: env.required("LWA_CLIENT_ID")?,
            lwa_client_secret: env.required("LWA_CLIENT_SECRET")?,
            lwa_refresh_token: env.required("LWA_REFRESH_TOKEN")?,
            seller_id: env.required("AMAZON_SELLER_ID")?,
            marketplace_id: env
                .string("MARKETPLACE_ID")
                .unwrap_or_else(|| DEFAULT_MARKETPLACE_ID.to_string()),
            endpoint: env
                .string("SP_API_ENDPOINT")
                .map(|url| url.trim_end_matches('/').to_string()),
            token_url: env
                .string("LWA_TOKEN_URL")
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
        };

        let defaults = ResilienceSettings::default();
        let resilience = ResilienceSettings {
            max_retries: env.parsed("MAX_RETRIES", defaults.max_retries)?,
            base_delay: env.secs("BASE_DELAY", defaults.base_delay)?,
            max_delay: env.secs("MAX_DELAY", defaults.max_delay)?,
            backoff_factor: env.parsed("BACKOFF_FACTOR", defaults.backoff_factor)?,
            jitter: env.flag("JITTER", defaults.jitter),
            max_connections: env.parsed("MAX_CONNECTIONS", defaults.max_connections)?,
            connection_timeout: env.secs("CONNECTION_TIMEOUT", defaults.connection_timeout)?,
            read_timeout: env.secs("READ_TIMEOUT", defaults.read_timeout)?,
            circuit_breaker_failure_threshold: env.parsed(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                defaults.circuit_breaker_failure_threshold,
            )?,
            circuit_breaker_error_rate_threshold: env.parsed(
                "CIRCUIT_BREAKER_ERROR_RATE_THRESHOLD",
                defaults.circuit_breaker_error_rate_threshold,
            )?,
            circuit_breaker_recovery_timeout: env.secs(
                "CIRCUIT_BREAKER_RECOVERY_TIMEOUT",
                defaults.circuit_breaker_recovery_timeout,
            )?,
            circuit_breaker_exempt: match env.string("CIRCUIT_BREAKER_EXEMPT") {
                Some(raw) => parse_list(&raw)
                    .iter()
                    .map(|name| {
                        EndpointCategory::from_str(name)
                            .map_err(|err| ConfigError::invalid("CIRCUIT_BREAKER_EXEMPT", err))
                    })
                    .collect::<Result<_, _>>()?,
                None => defaults.circuit_breaker_exempt,
            },
        };

        let defaults = CleanupSettings::default();
        let cleanup = CleanupSettings {
            dry_run: env.flag("DRY_RUN", defaults.dry_run),
            age_threshold_days: env.parsed("AGE_THRESHOLD_DAYS", defaults.age_threshold_days)?,
            batch_size: env.parsed("BATCH_SIZE", defaults.batch_size)?,
            batch_pause: Duration::from_millis(
                env.parsed("BATCH_PAUSE_MS", defaults.batch_pause.as_millis() as u64)?,
            ),
            cooldown_window: Duration::from_secs(
                env.parsed("COOLDOWN_SECS", defaults.cooldown_window.as_secs())?,
            ),
            skip_list: env
                .string("SKIP_SKUS")
                .map(|raw| parse_list(&raw).into_iter().collect())
                .unwrap_or_default(),
            test_mode: env.flag("TEST_MODE", defaults.test_mode),
            test_sample_size: env.parsed("TEST_SAMPLE_SIZE", defaults.test_sample_size)?,
            test_seed_skus: env
                .string("TEST_SEED_SKUS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            ledger_path: env
                .string("LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_path),
            report_path: env.string("REPORT_PATH").map(PathBuf::from),
            log_level: env
                .string("LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        let settings = Self {
            credentials,
            resilience,
            cleanup,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.resilience;
        if r.base_delay.is_zero() {
            return Err(ConfigError::invalid("BASE_DELAY", "must be greater than zero"));
        }
        if r.max_delay < r.base_delay {
            return Err(ConfigError::invalid("MAX_DELAY", "must be at least BASE_DELAY"));
        }
        if !(r.backoff_factor > 1.0) {
            return Err(ConfigError::invalid("BACKOFF_FACTOR", "must be greater than 1"));
        }
        if !(r.circuit_breaker_error_rate_threshold > 0.0
            && r.circuit_breaker_error_rate_threshold <= 1.0)
        {
            return Err(ConfigError::invalid(
                "CIRCUIT_BREAKER_ERROR_RATE_THRESHOLD",
                "must be in (0, 1]",
            ));
        }
        if r.max_connections == 0 {
            return Err(ConfigError::invalid("MAX_CONNECTIONS", "must be at least 1"));
        }
        if r.connection_timeout > r.read_timeout {
            return Err(ConfigError::invalid(
                "CONNECTION_TIMEOUT",
                "must not exceed READ_TIMEOUT",
            ));
        }
        if self.cleanup.batch_size == 0 {
            return Err(ConfigError::invalid("BATCH_SIZE", "must be at least 1"));
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.string(key).ok_or(ConfigError::Missing(key))
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.string(key)
            .map(|value| matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(default)
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|err| ConfigError::invalid(key, err.to_string())),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let value: f64 = self.parsed(key, default.as_secs_f64())?;
        Duration::try_from_secs_f64(value).map_err(|err| ConfigError::invalid(key, err.to_string()))
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
