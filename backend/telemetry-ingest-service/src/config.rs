//! Configuration management for the telemetry ingest service
//!
//! Loads configuration from environment variables. A variable that is unset
//! falls back to its default; a variable that is set but cannot be parsed is a
//! fatal configuration error.

use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Kafka consumer configuration
    pub kafka: KafkaConfig,
    /// Cassandra cluster configuration
    pub cassandra: CassandraConfig,
    /// Batch loop configuration
    pub pipeline: PipelineConfig,
}

/// Application settings
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host to bind the health endpoints to
    pub host: String,
    /// HTTP port for health checks and metrics
    pub http_port: u16,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

/// Kafka consumer configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Bootstrap brokers (comma-separated)
    pub brokers: String,
    /// Topic carrying sensor readings
    pub topic: String,
    /// Consumer group ID shared by cooperating instances
    pub group_id: String,
    /// Where to start when the group has no committed offset
    pub auto_offset_reset: OffsetReset,
    pub session_timeout_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(format!("expected `earliest` or `latest`, got `{}`", other)),
        }
    }
}

/// Cassandra cluster configuration
#[derive(Clone)]
pub struct CassandraConfig {
    /// Contact points (host names or addresses, without port)
    pub hosts: Vec<String>,
    pub port: u16,
    pub keyspace: String,
    pub table: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub replication_factor: u32,
    /// Local datacenter; switches the keyspace to NetworkTopologyStrategy and
    /// routes requests to this DC first
    pub local_datacenter: Option<String>,
    pub connect_timeout: Duration,
    /// Fixed wait between connection attempts
    pub connect_backoff: Duration,
    /// Bound on connection attempts (`None` = retry until shut down)
    pub connect_max_attempts: Option<u32>,
    /// Bound on a single batch write (`None` = wait for the acknowledgment)
    pub write_timeout: Option<Duration>,
}

impl std::fmt::Debug for CassandraConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CassandraConfig")
            .field("hosts", &self.hosts)
            .field("port", &self.port)
            .field("keyspace", &self.keyspace)
            .field("table", &self.table)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("replication_factor", &self.replication_factor)
            .field("local_datacenter", &self.local_datacenter)
            .field("connect_timeout", &self.connect_timeout)
            .field("connect_backoff", &self.connect_backoff)
            .field("connect_max_attempts", &self.connect_max_attempts)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

impl CassandraConfig {
    /// Contact points in `host:port` form
    pub fn contact_points(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|h| format!("{}:{}", h, self.port))
            .collect()
    }

    /// Credentials, only when both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Batch loop configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum messages per poll (and therefore per storage batch)
    pub batch_size: usize,
    /// Poll wait window
    pub poll_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_timeout: Duration::from_millis(default_poll_timeout_ms()),
        }
    }
}

// Default values
fn default_batch_size() -> usize {
    100
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_replication_factor() -> u32 {
    1
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let app = AppConfig {
            host: env.string("APP_HOST", "0.0.0.0"),
            http_port: env.parse("PORT", 8080)?,
            json_logs: env
                .optional_string("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        };

        let kafka = KafkaConfig {
            brokers: env.string("KAFKA_BOOTSTRAP", "localhost:9092"),
            topic: env.string("KAFKA_TOPIC", "sensor-data"),
            group_id: env.string("KAFKA_GROUP_ID", "cassandra-consumer"),
            auto_offset_reset: env.parse("KAFKA_AUTO_OFFSET_RESET", OffsetReset::Latest)?,
            session_timeout_ms: env.parse("KAFKA_SESSION_TIMEOUT_MS", 30_000)?,
        };

        let cassandra = CassandraConfig {
            hosts: env.list("CASSANDRA_HOSTS", "127.0.0.1"),
            port: env.parse("CASSANDRA_PORT", 9042)?,
            keyspace: env.string("CASSANDRA_KEYSPACE", "iot_demo"),
            table: env.string("CASSANDRA_TABLE", "sensor_data"),
            username: env.optional_string("CASSANDRA_USERNAME"),
            password: env.optional_string("CASSANDRA_PASSWORD"),
            replication_factor: env
                .parse("CASSANDRA_REPLICATION_FACTOR", default_replication_factor())?,
            local_datacenter: env.optional_string("CASSANDRA_LOCAL_DC"),
            connect_timeout: Duration::from_secs(env.parse("CASSANDRA_CONNECT_TIMEOUT_SECS", 10)?),
            connect_backoff: Duration::from_millis(env.parse("CASSANDRA_CONNECT_BACKOFF_MS", 2000)?),
            connect_max_attempts: env.optional_parse("CASSANDRA_CONNECT_MAX_ATTEMPTS")?,
            write_timeout: env
                .optional_parse::<u64>("CASSANDRA_WRITE_TIMEOUT_MS")?
                .map(Duration::from_millis),
        };

        let pipeline = PipelineConfig {
            batch_size: env.parse("CASSANDRA_BATCH_SIZE", default_batch_size())?,
            poll_timeout: Duration::from_millis(
                env.parse("KAFKA_POLL_TIMEOUT_MS", default_poll_timeout_ms())?,
            ),
        };

        let config = Config {
            app,
            kafka,
            cassandra,
            pipeline,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.brokers.trim().is_empty() {
            return Err(ConfigError::Empty("KAFKA_BOOTSTRAP"));
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(ConfigError::Empty("KAFKA_TOPIC"));
        }
        if self.kafka.group_id.trim().is_empty() {
            return Err(ConfigError::Empty("KAFKA_GROUP_ID"));
        }
        if self.cassandra.hosts.is_empty() {
            return Err(ConfigError::Empty("CASSANDRA_HOSTS"));
        }

        check_positive("CASSANDRA_PORT", u64::from(self.cassandra.port))?;
        check_identifier("CASSANDRA_KEYSPACE", &self.cassandra.keyspace)?;
        check_identifier("CASSANDRA_TABLE", &self.cassandra.table)?;
        check_positive(
            "CASSANDRA_REPLICATION_FACTOR",
            u64::from(self.cassandra.replication_factor),
        )?;
        check_positive("CASSANDRA_BATCH_SIZE", self.pipeline.batch_size as u64)?;
        check_positive(
            "KAFKA_POLL_TIMEOUT_MS",
            self.pipeline.poll_timeout.as_millis() as u64,
        )?;
        if let Some(attempts) = self.cassandra.connect_max_attempts {
            check_positive("CASSANDRA_CONNECT_MAX_ATTEMPTS", u64::from(attempts))?;
        }
        if let Some(dc) = &self.cassandra.local_datacenter {
            // Interpolated into the replication map literal
            if dc.contains('\'') {
                return Err(ConfigError::InvalidValue {
                    key: "CASSANDRA_LOCAL_DC",
                    value: dc.clone(),
                    reason: "must not contain quotes".to_string(),
                });
            }
        }

        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional_string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional_string(key)
            .unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        self.string(key, default)
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }

    fn optional_parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional_string(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key,
                    value: raw,
                    reason: e.to_string(),
                }),
        }
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional_parse(key)?.unwrap_or(default))
    }
}

fn check_positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Unquoted CQL identifier: letter first, then letters, digits or `_`, at most 48 chars
fn check_identifier(key: &'static str, name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = name.len() <= 48
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid {
        return Err(ConfigError::InvalidValue {
            key,
            value: name.to_string(),
            reason: "must be a CQL identifier ([A-Za-z][A-Za-z0-9_]*, max 48 chars)".to_string(),
        });
    }
    Ok(())
}
