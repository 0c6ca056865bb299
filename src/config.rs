//! Configuration types for the storage adapter.

use crate::error::{Error, Result};
use crate::pool::EndpointTarget;
use crate::types::{ConsistencyLevel, StoreTransaction};
use rand::seq::IndexedRandom;
use std::time::Duration;

/// Default RPC port of the remote store.
pub const DEFAULT_PORT: u16 = 9160;

/// Default keyspace holding all stores.
pub const DEFAULT_KEYSPACE: &str = "titan";

/// Main configuration for the store manager.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Candidate hostnames; the initial endpoint is picked at random.
    pub hostnames: Vec<String>,

    /// RPC port shared by all hosts.
    pub port: u16,

    /// Keyspace in which column families are created.
    pub keyspace: String,

    /// Replication factor for a newly created keyspace.
    pub replication_factor: u32,

    /// Connect and per-call timeout.
    pub connection_timeout: Duration,

    /// Largest outbound frame in bytes.
    pub frame_size: usize,

    /// Largest inbound message in bytes.
    pub max_message_size: usize,

    /// Consistency for reads issued by the adapter.
    pub read_consistency: ConsistencyLevel,

    /// Consistency for writes issued by the adapter.
    pub write_consistency: ConsistencyLevel,

    /// Connection pool configuration.
    pub pool: PoolConfig,

    /// Schema bootstrap configuration.
    pub schema: SchemaConfig,

    /// Hotspot steering configuration.
    pub steering: SteeringConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hostnames: vec!["127.0.0.1".to_string()],
            port: DEFAULT_PORT,
            keyspace: DEFAULT_KEYSPACE.to_string(),
            replication_factor: 1,
            connection_timeout: Duration::from_secs(10),
            frame_size: 15 * 1024 * 1024,       // 15MB
            max_message_size: 16 * 1024 * 1024, // 16MB
            read_consistency: ConsistencyLevel::Quorum,
            write_consistency: ConsistencyLevel::Quorum,
            pool: PoolConfig::default(),
            schema: SchemaConfig::default(),
            steering: SteeringConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a configuration for the given hosts.
    pub fn new(hostnames: Vec<String>) -> Self {
        Self {
            hostnames,
            ..Default::default()
        }
    }

    /// Set the RPC port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the keyspace name.
    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = keyspace.into();
        self
    }

    /// Set the replication factor.
    pub fn with_replication_factor(mut self, factor: u32) -> Self {
        self.replication_factor = factor;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set frame and message size limits.
    pub fn with_frame_limits(mut self, frame_size: usize, max_message_size: usize) -> Self {
        self.frame_size = frame_size;
        self.max_message_size = max_message_size;
        self
    }

    /// Set read and write consistency levels.
    pub fn with_consistency(mut self, read: ConsistencyLevel, write: ConsistencyLevel) -> Self {
        self.read_consistency = read;
        self.write_consistency = write;
        self
    }

    /// Set pool configuration.
    pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set schema configuration.
    pub fn with_schema_config(mut self, schema: SchemaConfig) -> Self {
        self.schema = schema;
        self
    }

    /// Set steering configuration.
    pub fn with_steering_config(mut self, steering: SteeringConfig) -> Self {
        self.steering = steering;
        self
    }

    /// Enable or disable hotspot steering.
    pub fn with_steering_enabled(mut self, enabled: bool) -> Self {
        self.steering.enabled = enabled;
        self
    }

    /// Check the configuration for values the adapter cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.hostnames.is_empty() || self.hostnames.iter().any(|h| h.trim().is_empty()) {
            return Err(Error::Config("at least one non-empty hostname is required".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".into()));
        }
        if self.keyspace.is_empty() {
            return Err(Error::Config("keyspace name must not be empty".into()));
        }
        if self.replication_factor == 0 {
            return Err(Error::Config("replication factor must be at least 1".into()));
        }
        if self.frame_size == 0 || self.max_message_size == 0 {
            return Err(Error::Config("frame and message size limits must be non-zero".into()));
        }
        if self.schema.poll_interval.is_zero() {
            return Err(Error::Config("schema poll interval must be non-zero".into()));
        }
        if self.steering.interval.is_zero() {
            return Err(Error::Config("steering interval must be non-zero".into()));
        }
        if !(self.steering.decay_per_ms > 0.0) {
            return Err(Error::Config("decay constant must be positive".into()));
        }
        Ok(())
    }

    /// Pick a random configured hostname for the initial endpoint.
    pub fn random_hostname(&self) -> Result<String> {
        self.hostnames
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| Error::Config("no hostnames configured".into()))
    }

    /// Build an endpoint target for a host using this configuration's limits.
    pub fn endpoint_for(&self, hostname: impl Into<String>) -> EndpointTarget {
        EndpointTarget {
            hostname: hostname.into(),
            port: self.port,
            timeout: self.connection_timeout,
            frame_size: self.frame_size,
            max_message_size: self.max_message_size,
        }
    }

    /// Transaction context carrying the configured consistency levels.
    pub fn default_transaction(&self) -> StoreTransaction {
        StoreTransaction::new(self.read_consistency, self.write_consistency)
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Soft cap on active plus idle connections across all namespaces.
    /// Borrowing still grows past it; returns above it are destroyed.
    pub max_total: usize,

    /// Probe liveness when lending a connection.
    pub test_on_borrow: bool,

    /// Validate when a connection comes back.
    pub test_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 32,
            test_on_borrow: true,
            test_on_return: true,
        }
    }
}

impl PoolConfig {
    /// Set the soft cap.
    pub fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = max_total;
        self
    }
}

/// Schema bootstrap configuration.
#[derive(Debug, Clone)]
pub struct SchemaConfig {
    /// How long to wait for the cluster to agree on a schema version.
    pub agreement_timeout: Duration,

    /// Delay between schema-version polls.
    pub poll_interval: Duration,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            agreement_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SchemaConfig {
    pub fn new(agreement_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            agreement_timeout,
            poll_interval,
        }
    }
}

/// Wait between steering-loop pool close attempts.
pub const STEERING_WAIT: Duration = Duration::from_millis(200);

/// Close attempts budgeted per steering interval.
pub const MAX_CLOSE_ATTEMPTS: u32 = 5;

/// Hotspot steering configuration.
#[derive(Debug, Clone)]
pub struct SteeringConfig {
    /// Run the steering loop when the partitioner is ordered.
    pub enabled: bool,

    /// Interval between steering ticks.
    pub interval: Duration,

    /// Exponential decay constant of hotness counters, per millisecond.
    pub decay_per_ms: f64,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(4000) + STEERING_WAIT * MAX_CLOSE_ATTEMPTS,
            decay_per_ms: 0.0005,
        }
    }
}

impl SteeringConfig {
    /// Set the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the decay constant.
    pub fn with_decay_per_ms(mut self, decay: f64) -> Self {
        self.decay_per_ms = decay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.port, 9160);
        assert_eq!(config.keyspace, "titan");
        assert_eq!(config.pool.max_total, 32);
        assert_eq!(config.steering.interval, Duration::from_millis(5000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new(vec!["10.0.0.1".into(), "10.0.0.2".into()])
            .with_port(9999)
            .with_keyspace("graph")
            .with_replication_factor(3)
            .with_steering_enabled(false);

        assert_eq!(config.port, 9999);
        assert_eq!(config.keyspace, "graph");
        assert_eq!(config.replication_factor, 3);
        assert!(!config.steering.enabled);

        let host = config.random_hostname().unwrap();
        assert!(config.hostnames.contains(&host));

        let target = config.endpoint_for(host.clone());
        assert_eq!(target.hostname, host);
        assert_eq!(target.port, 9999);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(StoreConfig::new(vec![]).validate().is_err());
        assert!(StoreConfig::default().with_replication_factor(0).validate().is_err());
        assert!(StoreConfig::default().with_port(0).validate().is_err());
        assert!(StoreConfig::default()
            .with_steering_config(SteeringConfig::default().with_decay_per_ms(0.0))
            .validate()
            .is_err());
    }
}
