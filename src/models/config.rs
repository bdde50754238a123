//! Configuration models for palisade.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The operator resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the resilience engine.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Storage locations for the durable stores
    #[serde(default)]
    pub storage: StorageConfig,

    /// Retry policy overrides, keyed by failure kind label
    /// (e.g. [retry.network_timeout])
    #[serde(default)]
    pub retry: HashMap<String, RetryPolicyConfig>,

    /// Circuit breaker settings, shared by all dependencies
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Idempotency ledger settings
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Batch driver settings
    #[serde(default)]
    pub batch: BatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            retry: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            idempotency: IdempotencyConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Storage locations for checkpoints, dead letters and transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all persisted state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Directory holding per-job checkpoint files.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Directory holding dead letter entries.
    pub fn dead_letter_dir(&self) -> PathBuf {
        self.data_dir.join("dead_letters")
    }

    /// Directory holding pending transaction files.
    pub fn transaction_dir(&self) -> PathBuf {
        self.data_dir.join("transactions")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Per-kind retry policy override.
///
/// Unset fields fall back to the built-in policy for that kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Maximum retry attempts before escalation
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Base delay in seconds (doubled per attempt)
    #[serde(default)]
    pub base_delay_secs: Option<f64>,

    /// Delay ceiling in seconds
    #[serde(default)]
    pub max_delay_secs: Option<f64>,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before an open circuit allows a half-open probe
    #[serde(default = "default_breaker_timeout")]
    pub timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_secs: default_breaker_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    60
}

/// Idempotency ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Record time-to-live in seconds (default: 24h)
    #[serde(default = "default_idempotency_ttl")]
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_idempotency_ttl(),
        }
    }
}

fn default_idempotency_ttl() -> u64 {
    24 * 60 * 60
}

/// Batch driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum concurrently running jobs
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Render a console progress bar while a batch runs
    #[serde(default = "default_true")]
    pub progress_bar: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            progress_bar: default_true(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&expand_env_vars(&content)).map_err(|e| {
            ConfigError::Parse {
                path: path.to_owned(),
                source: Box::new(e),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "circuit_breaker.failure_threshold".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.batch.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch.max_concurrent_jobs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for (kind, policy) in &self.retry {
            if !KNOWN_KINDS.contains(&kind.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("retry.{kind}"),
                    reason: format!("unknown failure kind (expected one of {KNOWN_KINDS:?})"),
                });
            }
            if let (Some(base), Some(max)) = (policy.base_delay_secs, policy.max_delay_secs) {
                if base > max {
                    return Err(ConfigError::InvalidValue {
                        field: format!("retry.{kind}"),
                        reason: "base_delay_secs must not exceed max_delay_secs".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

const KNOWN_KINDS: [&str; 7] = [
    "network_timeout",
    "api_rate_limit",
    "resource_unavailable",
    "invalid_input",
    "auth_failure",
    "out_of_memory",
    "unknown_error",
];

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Invalid values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.idempotency.ttl_secs, 86_400);
    }

    #[test]
    fn rejects_unknown_retry_kind() {
        let mut config = EngineConfig::default();
        config
            .retry
            .insert("flux_capacitor".to_string(), RetryPolicyConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [storage]
            data_dir = "/var/lib/palisade"

            [retry.network_timeout]
            max_retries = 7

            [circuit_breaker]
            failure_threshold = 3
            "#,
        )
        .unwrap();
        assert_eq!(
            config.storage.data_dir,
            PathBuf::from("/var/lib/palisade")
        );
        assert_eq!(config.retry["network_timeout"].max_retries, Some(7));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
    }

    #[test]
    fn expands_env_placeholders() {
        std::env::set_var("PALISADE_TEST_DIR", "/tmp/palisade");
        let expanded = expand_env_vars("data_dir = \"${PALISADE_TEST_DIR}\"");
        assert_eq!(expanded, "data_dir = \"/tmp/palisade\"");
    }
}
