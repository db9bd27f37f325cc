use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Countdown applied to subscriptions that set no timeout of their own.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable overriding [`DEFAULT_EVENT_TIMEOUT`], in milliseconds.
pub const DEFAULT_TIMEOUT_ENV: &str = "CONSEQUENCE_DEFAULT_TIMEOUT_MS";

/// Coordinator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Fallback countdown when neither the subscription nor the scope sets one.
    pub default_timeout: Duration,
}

impl CoordinatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_timeout_var(env::var(DEFAULT_TIMEOUT_ENV).ok().as_deref())
    }

    fn from_timeout_var(value: Option<&str>) -> Result<Self> {
        let default_timeout = match value {
            Some(millis) => Duration::from_millis(
                millis
                    .trim()
                    .parse()
                    .with_context(|| {
                        format!("{DEFAULT_TIMEOUT_ENV} must be a number of milliseconds")
                    })?,
            ),
            None => DEFAULT_EVENT_TIMEOUT,
        };
        Ok(Self { default_timeout })
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_EVENT_TIMEOUT,
        }
    }
}
