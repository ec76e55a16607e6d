//! Configuration for the replication process and client.

use std::time::Duration;

/// Default location of the oplog table.
pub const DEFAULT_OPLOG_TABLE: &str = "_electric_oplog";
/// Default location of the meta table.
pub const DEFAULT_META_TABLE: &str = "_electric_meta";
/// Default location of the migrations table.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "_electric_migrations";
/// Default location of the trigger settings table.
pub const DEFAULT_TRIGGER_SETTINGS_TABLE: &str = "_electric_trigger_settings";

/// Configuration of a replication process.
#[derive(Debug, Clone)]
pub struct SatelliteOpts {
    /// Name of the meta key/value table.
    pub meta_table: String,
    /// Name of the oplog table.
    pub oplog_table: String,
    /// Name of the applied migrations table.
    pub migrations_table: String,
    /// Name of the table holding per-table trigger flags.
    pub trigger_settings_table: String,
    /// How often the process snapshots without being asked.
    pub polling_interval: Duration,
    /// Minimum spacing between two snapshots.
    pub min_snapshot_window: Duration,
}

impl SatelliteOpts {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            meta_table: DEFAULT_META_TABLE.into(),
            oplog_table: DEFAULT_OPLOG_TABLE.into(),
            migrations_table: DEFAULT_MIGRATIONS_TABLE.into(),
            trigger_settings_table: DEFAULT_TRIGGER_SETTINGS_TABLE.into(),
            polling_interval: Duration::from_secs(2),
            min_snapshot_window: Duration::from_millis(40),
        }
    }

    /// Sets the polling interval.
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the minimum snapshot window.
    pub fn with_min_snapshot_window(mut self, window: Duration) -> Self {
        self.min_snapshot_window = window;
        self
    }

    /// Sets the oplog table name.
    pub fn with_oplog_table(mut self, name: impl Into<String>) -> Self {
        self.oplog_table = name.into();
        self
    }

    /// Sets the meta table name.
    pub fn with_meta_table(mut self, name: impl Into<String>) -> Self {
        self.meta_table = name.into();
        self
    }

    /// Tables the process maintains itself. These never replicate.
    pub fn system_tables(&self) -> [&str; 4] {
        [
            &self.meta_table,
            &self.oplog_table,
            &self.migrations_table,
            &self.trigger_settings_table,
        ]
    }
}

impl Default for SatelliteOpts {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of the replication client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Time allowed for a response, reset by any inbound traffic.
    pub timeout: Duration,
    /// Batch size requested in sync mode; `None` disables sync mode.
    pub sync_batch_size: Option<u32>,
    /// Connection retry policy.
    pub retry: RetryConfig,
}

impl ClientOptions {
    /// Creates options for a server address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(3),
            sync_batch_size: None,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables sync mode with the given batch size.
    pub fn with_sync_batch_size(mut self, size: u32) -> Self {
        self.sync_batch_size = Some(size);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new("127.0.0.1", 30002)
    }
}

/// Application identity used to authenticate the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// Application name.
    pub app: String,
    /// Environment name.
    pub env: String,
    /// Access token; falls back to the stored token when `None`.
    pub token: Option<String>,
}

impl AuthConfig {
    /// Creates an auth configuration without a token.
    pub fn new(app: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            env: env.into(),
            token: None,
        }
    }

    /// Sets the access token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of connection attempts.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration allowing `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that connects once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Delay before attempt `attempt` (0-indexed; the first attempt is immediate).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25% on top
            Duration::from_secs_f64(delay_secs * (1.0 + 0.25 * jitter_fraction()))
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
