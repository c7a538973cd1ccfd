//! Gateway configuration.
//!
//! [`GatewayConfig`] names the backend endpoints, the default table and key
//! attribute names, the admission capacity, and the retry policies. The
//! gateway never dials the endpoints itself: the caller builds backend
//! clients from this configuration and hands them to
//! [`Gateway::new`](crate::Gateway::new).
//!
//! Every section deserializes with `serde` (durations as humantime strings
//! such as `"500ms"`) and is built through a validating `bon` builder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default long retry delay (throughput-class errors).
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(500);

/// Default short retry delay (internal-error class).
pub const DEFAULT_IMMEDIATE_DELAY: Duration = Duration::from_millis(100);

/// Hard ceiling on retry attempts requested by callers.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Default initial backoff between batch re-drives.
pub const DEFAULT_BATCH_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Default cap on the batch re-drive backoff.
pub const DEFAULT_BATCH_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Default number of batch attempts (initial call included).
pub const DEFAULT_BATCH_MAX_ATTEMPTS: u32 = 5;

/// Default admission capacity.
pub const DEFAULT_ADMISSION_CAPACITY: usize = 64;

/// Default partition key attribute name.
pub const DEFAULT_PK_NAME: &str = "PK";

/// What happens to a suppressible error once retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionPolicy {
    /// Known-benign transient errors (throughput, request rate, internal
    /// server errors) are logged and reported to the caller as success.
    #[default]
    SuppressTransient,
    /// Every error is surfaced, including suppressible ones.
    Surface,
}

/// Retry behaviour for single-item operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Delay before retrying an error that needs backoff.
    #[serde(with = "humantime_serde", default = "default_backoff_delay")]
    pub(crate) backoff_delay: Duration,
    /// Delay before retrying an error that does not need backoff.
    #[serde(with = "humantime_serde", default = "default_immediate_delay")]
    pub(crate) immediate_delay: Duration,
    /// Ceiling applied to caller-requested attempt counts.
    #[serde(default = "default_max_attempts_ceiling")]
    pub(crate) max_attempts_ceiling: u32,
    /// Suppression policy.
    #[serde(default)]
    pub(crate) suppression: SuppressionPolicy,
}

fn default_backoff_delay() -> Duration {
    DEFAULT_BACKOFF_DELAY
}

fn default_immediate_delay() -> Duration {
    DEFAULT_IMMEDIATE_DELAY
}

fn default_max_attempts_ceiling() -> u32 {
    MAX_RETRY_ATTEMPTS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_delay: DEFAULT_BACKOFF_DELAY,
            immediate_delay: DEFAULT_IMMEDIATE_DELAY,
            max_attempts_ceiling: MAX_RETRY_ATTEMPTS,
            suppression: SuppressionPolicy::default(),
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_attempts_ceiling` exceeds
    /// [`MAX_RETRY_ATTEMPTS`].
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_BACKOFF_DELAY)] backoff_delay: Duration,
        #[builder(default = DEFAULT_IMMEDIATE_DELAY)] immediate_delay: Duration,
        #[builder(default = MAX_RETRY_ATTEMPTS)] max_attempts_ceiling: u32,
        #[builder(default)] suppression: SuppressionPolicy,
    ) -> Result<Self, ConfigError> {
        let config = Self { backoff_delay, immediate_delay, max_attempts_ceiling, suppression };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces; used for deserialized values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on an out-of-range ceiling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts_ceiling > MAX_RETRY_ATTEMPTS {
            return Err(ConfigError::AboveMaximum {
                field: "max_attempts_ceiling",
                max: MAX_RETRY_ATTEMPTS.to_string(),
                value: self.max_attempts_ceiling.to_string(),
            });
        }
        Ok(())
    }

    /// Returns the long retry delay.
    #[must_use]
    pub fn backoff_delay(&self) -> Duration {
        self.backoff_delay
    }

    /// Returns the short retry delay.
    #[must_use]
    pub fn immediate_delay(&self) -> Duration {
        self.immediate_delay
    }

    /// Returns the attempt ceiling.
    #[must_use]
    pub fn max_attempts_ceiling(&self) -> u32 {
        self.max_attempts_ceiling
    }

    /// Returns the suppression policy.
    #[must_use]
    pub fn suppression(&self) -> SuppressionPolicy {
        self.suppression
    }
}

/// Re-drive policy for batch operations with unprocessed leftovers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchRetryConfig {
    /// First backoff between attempts; doubles each attempt.
    #[serde(with = "humantime_serde", default = "default_batch_initial_backoff")]
    pub(crate) initial_backoff: Duration,
    /// Backoff cap.
    #[serde(with = "humantime_serde", default = "default_batch_max_backoff")]
    pub(crate) max_backoff: Duration,
    /// Total attempts, the initial call included.
    #[serde(default = "default_batch_max_attempts")]
    pub(crate) max_attempts: u32,
}

fn default_batch_initial_backoff() -> Duration {
    DEFAULT_BATCH_INITIAL_BACKOFF
}

fn default_batch_max_backoff() -> Duration {
    DEFAULT_BATCH_MAX_BACKOFF
}

fn default_batch_max_attempts() -> u32 {
    DEFAULT_BATCH_MAX_ATTEMPTS
}

impl Default for BatchRetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_BATCH_INITIAL_BACKOFF,
            max_backoff: DEFAULT_BATCH_MAX_BACKOFF,
            max_attempts: DEFAULT_BATCH_MAX_ATTEMPTS,
        }
    }
}

#[bon::bon]
impl BatchRetryConfig {
    /// Creates a batch re-drive configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_attempts` is zero, or
    /// `initial_backoff` exceeds `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_BATCH_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_BATCH_MAX_BACKOFF)] max_backoff: Duration,
        #[builder(default = DEFAULT_BATCH_MAX_ATTEMPTS)] max_attempts: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self { initial_backoff, max_backoff, max_attempts };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the builder enforces.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_attempts",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvalidRange {
                field: "initial_backoff",
                message: format!(
                    "initial backoff {:?} exceeds max backoff {:?}",
                    self.initial_backoff, self.max_backoff
                ),
            });
        }
        Ok(())
    }

    /// Returns the initial backoff.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the backoff cap.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the attempt budget.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before re-drive number `retry` (0-based):
    /// `min(initial_backoff * 2^retry, max_backoff)`.
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// HTTP transport tuning handed to backend clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpTransportConfig {
    /// Connection establishment timeout.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Idle connections kept per host.
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_connections_per_host: usize,
    /// How long an idle connection is kept.
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_idle_per_host() -> usize {
    100
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            max_idle_connections_per_host: default_max_idle_per_host(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Top-level gateway configuration.
///
/// # Example
///
/// ```
/// use docstore_gateway::GatewayConfig;
///
/// let config = GatewayConfig::builder()
///     .region("us-east-1")
///     .table_name("orders")
///     .pk_name("PK")
///     .sk_name("SK")
///     .admission_capacity(32)
///     .build()?;
/// assert_eq!(config.table_name(), "orders");
/// # Ok::<(), docstore_gateway::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub(crate) region: String,
    #[serde(default)]
    pub(crate) endpoint: Option<String>,
    #[serde(default)]
    pub(crate) accelerator_endpoint: Option<String>,
    #[serde(default)]
    pub(crate) skip_accelerator: bool,
    #[serde(default)]
    pub(crate) http: HttpTransportConfig,
    pub(crate) table_name: String,
    #[serde(default = "default_pk_name")]
    pub(crate) pk_name: String,
    #[serde(default)]
    pub(crate) sk_name: Option<String>,
    #[serde(default = "default_admission_capacity")]
    pub(crate) admission_capacity: usize,
    #[serde(default)]
    pub(crate) retry: RetryConfig,
    #[serde(default)]
    pub(crate) batch: BatchRetryConfig,
}

fn default_pk_name() -> String {
    DEFAULT_PK_NAME.to_owned()
}

fn default_admission_capacity() -> usize {
    DEFAULT_ADMISSION_CAPACITY
}

#[bon::bon]
impl GatewayConfig {
    /// Creates a configuration, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the region or table name is empty, the
    /// partition key name is empty, or the admission capacity is zero.
    #[builder]
    pub fn new(
        #[builder(into)] region: String,
        #[builder(into)] endpoint: Option<String>,
        #[builder(into)] accelerator_endpoint: Option<String>,
        #[builder(default)] skip_accelerator: bool,
        #[builder(default)] http: HttpTransportConfig,
        #[builder(into)] table_name: String,
        #[builder(into, default = DEFAULT_PK_NAME.to_owned())] pk_name: String,
        #[builder(into)] sk_name: Option<String>,
        #[builder(default = DEFAULT_ADMISSION_CAPACITY)] admission_capacity: usize,
        #[builder(default)] retry: RetryConfig,
        #[builder(default)] batch: BatchRetryConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            region,
            endpoint,
            accelerator_endpoint,
            skip_accelerator,
            http,
            table_name,
            pk_name,
            sk_name,
            admission_capacity,
            retry,
            batch,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration, typically one obtained through `serde`.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.is_empty() {
            return Err(ConfigError::Missing { field: "region" });
        }
        if self.table_name.is_empty() {
            return Err(ConfigError::Missing { field: "table_name" });
        }
        if self.pk_name.is_empty() {
            return Err(ConfigError::Missing { field: "pk_name" });
        }
        if self.sk_name.as_deref() == Some("") {
            return Err(ConfigError::Missing { field: "sk_name" });
        }
        if self.admission_capacity == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "admission_capacity",
                min: "1".into(),
                value: "0".into(),
            });
        }
        self.retry.validate()?;
        self.batch.validate()
    }

    /// Returns the backend region.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Returns the primary endpoint override.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Returns the accelerator endpoint.
    #[must_use]
    pub fn accelerator_endpoint(&self) -> Option<&str> {
        self.accelerator_endpoint.as_deref()
    }

    /// Returns whether the accelerator is bypassed.
    #[must_use]
    pub fn skip_accelerator(&self) -> bool {
        self.skip_accelerator
    }

    /// Returns HTTP transport tuning.
    #[must_use]
    pub fn http(&self) -> &HttpTransportConfig {
        &self.http
    }

    /// Returns the default table.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Returns the default partition key name.
    #[must_use]
    pub fn pk_name(&self) -> &str {
        &self.pk_name
    }

    /// Returns the default sort key name.
    #[must_use]
    pub fn sk_name(&self) -> Option<&str> {
        self.sk_name.as_deref()
    }

    /// Returns the admission capacity.
    #[must_use]
    pub fn admission_capacity(&self) -> usize {
        self.admission_capacity
    }

    /// Returns the single-item retry configuration.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the batch re-drive configuration.
    #[must_use]
    pub fn batch(&self) -> &BatchRetryConfig {
        &self.batch
    }
}
