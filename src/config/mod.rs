//! Application configuration.
//!
//! Aggregates the broker connection, topic defaults, consumer and reader
//! settings into a single Config struct that can be loaded from YAML files
//! or environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::{OffsetReset, TopicSpec};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVLOG_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVLOG";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub kafka: KafkaConfig,
    /// Defaults for topics created on first use.
    pub topics: TopicDefaults,
    /// Consumer runner defaults.
    pub consumer: ConsumerDefaults,
    /// Replay defaults.
    pub reader: ReaderDefaults,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix and `__`
    ///    separators, e.g. `EVLOG__KAFKA__BOOTSTRAP_SERVERS`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Kafka connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
    /// Idempotent producer. Off only for brokers that reject it.
    pub enable_idempotence: bool,
    /// Start position for groups without committed offsets.
    pub auto_offset_reset: OffsetReset,
    pub message_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    /// Report end-of-partition to consumer runners (readers always enable it).
    pub enable_partition_eof: bool,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            enable_idempotence: true,
            auto_offset_reset: OffsetReset::Earliest,
            message_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            max_poll_interval_ms: 300_000,
            enable_partition_eof: false,
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Self::default()
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    pub fn with_auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }
}

/// Defaults for topics created on first use.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TopicDefaults {
    pub partitions: i32,
    pub replication_factor: i32,
}

impl Default for TopicDefaults {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
        }
    }
}

impl TopicDefaults {
    /// Creation parameters for `topic` using these defaults.
    pub fn spec(&self, topic: impl Into<String>) -> TopicSpec {
        TopicSpec::new(topic)
            .with_partitions(self.partitions)
            .with_replication_factor(self.replication_factor)
    }
}

/// Consumer runner defaults.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ConsumerDefaults {
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
}

impl Default for ConsumerDefaults {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            shutdown_timeout_ms: 10_000,
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 5_000,
        }
    }
}

/// Replay defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderDefaults {
    pub poll_timeout_ms: u64,
    /// Consecutive empty polls that end a replay.
    pub max_idle_polls: u32,
    pub assignment_timeout_ms: u64,
    /// Prefix of the ephemeral consumer group opened per replay.
    pub group_prefix: String,
}

impl Default for ReaderDefaults {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 250,
            max_idle_polls: 4,
            assignment_timeout_ms: 10_000,
            group_prefix: "evlog-replay".to_string(),
        }
    }
}
