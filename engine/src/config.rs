//! Engine configuration.

use std::time::Duration;

use paywallet_common::{ReferenceGenerator, Result, WalletError, DEFAULT_PREFIX};

/// Retry policy for transient storage failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per operation, including the first one.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub base_backoff: Duration,
    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Transaction engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default deadline applied to every operation. A request deadline that
    /// expires earlier wins.
    pub operation_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Prefix of system-generated references.
    pub reference_prefix: String,
    /// Longest accepted description, in characters.
    pub max_description_len: usize,
    /// Longest accepted payment method tag, in characters.
    pub max_payment_method_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            reference_prefix: DEFAULT_PREFIX.to_string(),
            max_description_len: 255,
            max_payment_method_len: 32,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("PAYWALLET_OPERATION_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.operation_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(attempts) = std::env::var("PAYWALLET_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.retry.max_attempts = attempts;
            }
        }

        if let Ok(ms) = std::env::var("PAYWALLET_RETRY_BASE_BACKOFF_MS") {
            if let Ok(ms) = ms.parse() {
                config.retry.base_backoff = Duration::from_millis(ms);
            }
        }

        if let Ok(ms) = std::env::var("PAYWALLET_RETRY_MAX_BACKOFF_MS") {
            if let Ok(ms) = ms.parse() {
                config.retry.max_backoff = Duration::from_millis(ms);
            }
        }

        if let Ok(prefix) = std::env::var("PAYWALLET_REFERENCE_PREFIX") {
            config.reference_prefix = prefix;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout.is_zero() {
            return Err(WalletError::Configuration(
                "Operation timeout cannot be 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(WalletError::Configuration(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }

        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(WalletError::Configuration(
                "Base backoff cannot exceed max backoff".to_string(),
            ));
        }

        if self.max_payment_method_len == 0 {
            return Err(WalletError::Configuration(
                "Payment method length limit cannot be 0".to_string(),
            ));
        }

        self.reference_generator()?;
        Ok(())
    }

    /// Reference generator for the configured prefix.
    pub fn reference_generator(&self) -> Result<ReferenceGenerator> {
        ReferenceGenerator::new(self.reference_prefix.as_str()).map_err(|e| {
            WalletError::Configuration(format!("Invalid reference prefix: {e}"))
        })
    }
}
