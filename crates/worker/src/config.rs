//! Environment-driven configuration.

use std::time::Duration;

use secrecy::SecretString;

use inscriber_core::RetryPolicy;
use inscriber_infra::jobs::{InscriptionWorkerConfig, ProcessorConfig};
use inscriber_infra::ledger::{
    DEFAULT_TAG_DATATYPE, DEFAULT_TAG_HANDLE, HttpLedgerConfig, LedgerTag,
};
use inscriber_infra::queue::{DEFAULT_DELAYED_KEY, DEFAULT_READY_KEY, QueueKeys};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Ledger connection settings. Credentials may be absent; see [`LedgerSettings::http_config`].
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub rpc_url: Option<String>,
    pub signing_key: Option<SecretString>,
    pub timeout: Duration,
    pub tag: LedgerTag,
}

impl LedgerSettings {
    /// Names of the settings needed for a real ledger client that are not set.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.rpc_url.is_none() {
            missing.push("LEDGER_RPC_URL");
        }
        if self.signing_key.is_none() {
            missing.push("LEDGER_SIGNING_KEY");
        }
        missing
    }

    /// `None` unless both the URL and the signing key are present.
    pub fn http_config(&self) -> Option<HttpLedgerConfig> {
        Some(HttpLedgerConfig {
            rpc_url: self.rpc_url.clone()?,
            signing_key: self.signing_key.clone()?,
            timeout: self.timeout,
        })
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: SecretString,
    pub redis_url: SecretString,
    pub keys: QueueKeys,
    pub retry: RetryPolicy,
    pub pop_timeout: Duration,
    pub promote_batch: usize,
    pub ledger: LedgerSettings,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let max_attempts: u32 = env.parsed("INSCRIPTION_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(invalid("INSCRIPTION_MAX_ATTEMPTS", "must be at least 1"));
        }

        let promote_batch: usize = env.parsed("INSCRIPTION_PROMOTE_BATCH", 25)?;
        if promote_batch == 0 {
            return Err(invalid("INSCRIPTION_PROMOTE_BATCH", "must be at least 1"));
        }

        Ok(Self {
            database_url: SecretString::from(env.required("DATABASE_URL")?),
            redis_url: SecretString::from(env.required("REDIS_URL")?),
            keys: QueueKeys::new(
                env.string_or("INSCRIPTION_READY_KEY", DEFAULT_READY_KEY),
                env.string_or("INSCRIPTION_DELAYED_KEY", DEFAULT_DELAYED_KEY),
            ),
            retry: RetryPolicy::new(max_attempts, env.seconds("INSCRIPTION_BACKOFF_BASE_SECS", 5.0)?),
            pop_timeout: env.seconds("INSCRIPTION_POP_TIMEOUT_SECS", 5.0)?,
            promote_batch,
            ledger: LedgerSettings {
                rpc_url: env.optional("LEDGER_RPC_URL"),
                signing_key: env.optional("LEDGER_SIGNING_KEY").map(SecretString::from),
                timeout: env.seconds("LEDGER_TIMEOUT_SECS", 30.0)?,
                tag: LedgerTag::new(
                    env.string_or("LEDGER_DATATYPE", DEFAULT_TAG_DATATYPE),
                    env.string_or("LEDGER_HANDLE", DEFAULT_TAG_HANDLE),
                ),
            },
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig::default()
            .with_retry(self.retry)
            .with_keys(self.keys.clone())
            .with_tag(self.ledger.tag.clone())
            .with_submit_timeout(self.ledger.timeout)
    }

    pub fn worker_config(&self) -> InscriptionWorkerConfig {
        InscriptionWorkerConfig::default()
            .with_pop_timeout(self.pop_timeout)
            .with_promote_batch(self.promote_batch)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e| invalid(key, format!("{raw:?}: {e}"))),
            None => Ok(default),
        }
    }

    /// Positive, finite number of seconds (fractions allowed).
    fn seconds(&self, key: &str, default: f64) -> Result<Duration, ConfigError> {
        let secs: f64 = self.parsed(key, default)?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(invalid(key, "must be a positive number of seconds"));
        }
        Duration::try_from_secs_f64(secs).map_err(|e| invalid(key, e.to_string()))
    }
}
