//! The store manager: entry point used by the graph engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       StoreManager                          │
//! │  open_store ──> SchemaManager ──┐                           │
//! │  mutate_many ─> translate ──────┼──> ConnectionPool ──> RPC │
//! │        │                        │          ▲                │
//! │        ▼                        │          │ retarget+close │
//! │  HotspotTracker <── RingTracker <┴── Steering (background)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod handle;

pub use handle::KeyColumnValueStore;

use crate::client::{Column, Connector};
use crate::config::StoreConfig;
use crate::error::{ClientError, Error, Result};
use crate::metrics::StoreMetrics;
use crate::mutation::{translate, MutationTimestamps};
use crate::partitioning::{HotspotTracker, RingTracker};
use crate::pool::{ConnectionFactory, ConnectionPool, EndpointTarget};
use crate::schema::{SchemaManager, BYTES_COMPARATOR, UTF8_COMPARATOR};
use crate::steering::Steering;
use crate::types::{
    ConsistencyLevel, Partitioner, StoreFeatures, StoreMutations, StoreTransaction,
    SYSTEM_KEYSPACE,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Column family holding configuration properties.
pub const SYSTEM_PROPERTIES_CF: &str = "system_properties";

/// Row key of the configuration property row.
pub const SYSTEM_PROPERTIES_KEY: &str = "general";

/// State shared between the manager and its store handles.
pub(crate) struct Backend {
    config: StoreConfig,
    pool: ConnectionPool,
    partitioner: Partitioner,
    ring: Arc<RingTracker>,
    hotspots: Arc<HotspotTracker>,
    metrics: Arc<StoreMetrics>,
}

impl Backend {
    async fn mutate_many(&self, mutations: &StoreMutations, tx: &StoreTransaction) -> Result<()> {
        let translated = translate(mutations, MutationTimestamps::now());
        if translated.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.borrow(&self.config.keyspace).await?;
        debug!(
            keys = translated.batch.len(),
            operations = translated.operations,
            target = %conn.target(),
            "Sending mutation batch"
        );
        if let Err(e) = conn
            .client_mut()
            .batch_mutate(translated.batch, tx.write_consistency())
            .await
        {
            self.metrics.mutation_failures.inc();
            if matches!(e, ClientError::Transport(_) | ClientError::Protocol(_)) {
                conn.poison();
            }
            warn!(error = %e, "Mutation batch failed");
            return Err(e.classify("batch_mutate"));
        }
        drop(conn);

        self.metrics.mutation_batches.inc();
        for (store, by_key) in mutations {
            let columns: usize = by_key.values().map(|m| m.len()).sum();
            self.metrics.columns_written.inc_by([store.as_str()], columns as u64);
        }

        if self.partitioner.is_ordered() {
            if let Some(key) = translated.representative_key {
                self.hotspots.record_write(&self.ring.snapshot(), &key);
            }
        }
        Ok(())
    }

    async fn get_column(
        &self,
        column_family: &str,
        key: &[u8],
        column: &[u8],
        consistency: ConsistencyLevel,
    ) -> Result<Option<Bytes>> {
        let mut conn = self.pool.borrow(&self.config.keyspace).await?;
        match conn
            .client_mut()
            .get(key, column_family, column, consistency)
            .await
        {
            Ok(column) => Ok(Some(column.value)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.classify(&format!("get from {}", column_family))),
        }
    }

    async fn insert_column(
        &self,
        column_family: &str,
        key: &[u8],
        column: Bytes,
        value: Bytes,
        consistency: ConsistencyLevel,
    ) -> Result<()> {
        let timestamp = MutationTimestamps::now().addition;
        let mut conn = self.pool.borrow(&self.config.keyspace).await?;
        conn.client_mut()
            .insert(key, column_family, Column::new(column, value, timestamp), consistency)
            .await
            .map_err(|e| e.classify(&format!("insert into {}", column_family)))
    }
}

/// Storage adapter for one keyspace of a ring-partitioned column store.
pub struct StoreManager {
    backend: Arc<Backend>,
    schema: SchemaManager,
    stores: Mutex<HashMap<String, KeyColumnValueStore>>,
    system_properties: OnceCell<()>,
    steering: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl StoreManager {
    /// Connect to the cluster through `connector`.
    ///
    /// Picks a random configured host as the initial target, detects the
    /// partitioner, and starts hotspot steering when the partitioner keeps
    /// keys in order.
    pub async fn connect(config: StoreConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let host = config.random_hostname()?;
        let metrics = Arc::new(StoreMetrics::new());
        let factory = Arc::new(ConnectionFactory::new(connector, config.endpoint_for(host)));
        let pool = ConnectionPool::new(factory, config.pool.clone(), metrics.clone());

        let partitioner = Self::detect_partitioner(&pool).await?;
        let ring = Arc::new(RingTracker::new(partitioner, metrics.clone()));
        let hotspots = Arc::new(HotspotTracker::new(config.steering.decay_per_ms));
        let cancel = CancellationToken::new();

        let schema = SchemaManager::new(
            pool.clone(),
            config.replication_factor,
            config.schema.clone(),
            cancel.clone(),
        );

        let mut steering = None;
        if partitioner.is_ordered() {
            ring.refresh(&pool).await;
            if config.steering.enabled {
                let task = Arc::new(Steering::new(
                    pool.clone(),
                    ring.clone(),
                    hotspots.clone(),
                    config.steering.clone(),
                    metrics.clone(),
                ));
                steering = Some(task.start(cancel.clone()));
            }
        } else {
            debug!(?partitioner, "Hash partitioner, hotspot steering disabled");
        }

        info!(
            target = %pool.factory().target(),
            keyspace = %config.keyspace,
            ?partitioner,
            steering = steering.is_some(),
            "Store manager connected"
        );

        Ok(Self {
            backend: Arc::new(Backend {
                config,
                pool,
                partitioner,
                ring,
                hotspots,
                metrics,
            }),
            schema,
            stores: Mutex::new(HashMap::new()),
            system_properties: OnceCell::new(),
            steering: parking_lot::Mutex::new(steering),
            cancel,
        })
    }

    async fn detect_partitioner(pool: &ConnectionPool) -> Result<Partitioner> {
        let mut conn = pool.borrow(SYSTEM_KEYSPACE).await?;
        let class_name = conn
            .client_mut()
            .describe_partitioner()
            .await
            .map_err(|e| Error::temporary("describe partitioner", e))?;
        Partitioner::from_class_name(&class_name)
    }

    /// Open (creating if needed) the store `name`.
    ///
    /// Opens are serialized, so concurrent first opens of one name run a
    /// single schema bootstrap.
    pub async fn open_store(&self, name: &str) -> Result<KeyColumnValueStore> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(name) {
            return Ok(store.clone());
        }

        let keyspace = &self.backend.config.keyspace;
        self.schema.ensure_keyspace(keyspace).await?;
        self.schema
            .ensure_column_family(keyspace, name, BYTES_COMPARATOR)
            .await?;

        let store = KeyColumnValueStore::new(name.to_string(), self.backend.clone());
        stores.insert(name.to_string(), store.clone());
        self.backend.metrics.open_stores.set(stores.len() as i64);
        info!(store = %name, %keyspace, "Opened store");
        Ok(store)
    }

    /// Apply mutations for several stores and keys as one batch.
    pub async fn mutate_many(&self, mutations: &StoreMutations, tx: &StoreTransaction) -> Result<()> {
        self.backend.mutate_many(mutations, tx).await
    }

    async fn ensure_system_properties(&self) -> Result<()> {
        self.system_properties
            .get_or_try_init(|| async {
                let keyspace = &self.backend.config.keyspace;
                self.schema.ensure_keyspace(keyspace).await?;
                self.schema
                    .ensure_column_family(keyspace, SYSTEM_PROPERTIES_CF, UTF8_COMPARATOR)
                    .await
            })
            .await
            .map(|_| ())
    }

    /// Read a configuration property, `None` if it was never set.
    pub async fn get_config_property(&self, key: &str) -> Result<Option<String>> {
        self.ensure_system_properties().await?;
        let value = self
            .backend
            .get_column(
                SYSTEM_PROPERTIES_CF,
                SYSTEM_PROPERTIES_KEY.as_bytes(),
                key.as_bytes(),
                ConsistencyLevel::Quorum,
            )
            .await?;
        value
            .map(|v| {
                String::from_utf8(v.to_vec())
                    .map_err(|e| Error::permanent(&format!("config property {}", key), e))
            })
            .transpose()
    }

    /// Write a configuration property.
    pub async fn set_config_property(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_system_properties().await?;
        self.backend
            .insert_column(
                SYSTEM_PROPERTIES_CF,
                SYSTEM_PROPERTIES_KEY.as_bytes(),
                Bytes::copy_from_slice(key.as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
                ConsistencyLevel::Quorum,
            )
            .await
    }

    /// Truncate every column family of the keyspace.
    ///
    /// A keyspace that does not exist yet has nothing to clear.
    pub async fn clear_storage(&self) -> Result<()> {
        let keyspace = &self.backend.config.keyspace;
        let mut stores = self.stores.lock().await;

        let Some(def) = self.schema.describe_keyspace(keyspace).await? else {
            debug!(%keyspace, "Keyspace does not exist, nothing to clear");
            stores.clear();
            return Ok(());
        };

        let mut conn = self.backend.pool.borrow(keyspace).await?;
        for cf in &def.column_families {
            conn.client_mut()
                .truncate(&cf.name)
                .await
                .map_err(|e| e.classify(&format!("truncate {}.{}", keyspace, cf.name)))?;
            debug!(%keyspace, column_family = %cf.name, "Truncated column family");
        }
        drop(conn);

        stores.clear();
        self.backend.metrics.open_stores.set(0);
        info!(%keyspace, column_families = def.column_families.len(), "Cleared storage");
        Ok(())
    }

    /// Stop steering, forget open stores and shut the pool down.
    pub async fn close(&self) {
        self.cancel.cancel();
        let steering = self.steering.lock().take();
        if let Some(handle) = steering {
            if let Err(e) = handle.await {
                warn!(error = %e, "Steering task ended abnormally");
            }
        }

        self.stores.lock().await.clear();
        self.backend.pool.shutdown();
        self.backend.metrics.open_stores.set(0);
        info!("Store manager closed");
    }

    /// The cluster's partitioner.
    pub fn partitioner(&self) -> Partitioner {
        self.backend.partitioner
    }

    /// A transaction context with the configured consistency levels.
    pub fn begin_transaction(&self) -> StoreTransaction {
        self.backend.config.default_transaction()
    }

    pub fn features(&self) -> StoreFeatures {
        StoreFeatures::for_partitioner(self.backend.partitioner)
    }

    /// Range-end token of the partition holding `key`, if the ring is known.
    pub fn key_end_token(&self, key: &[u8]) -> Option<Bytes> {
        self.backend.ring.key_end_token(key)
    }

    /// Endpoint owning `key`, if the ring is known.
    pub fn key_hostname(&self, key: &[u8]) -> Option<String> {
        self.backend.ring.key_hostname(key)
    }

    /// Endpoint new connections are opened against.
    pub fn current_target(&self) -> Arc<EndpointTarget> {
        self.backend.pool.factory().target()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.backend.config
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.backend.metrics
    }

    /// Whether the steering loop is running.
    pub fn is_steering(&self) -> bool {
        self.steering
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for StoreManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("keyspace", &self.backend.config.keyspace)
            .field("partitioner", &self.backend.partitioner)
            .field("pool", &self.backend.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryCluster;
    use crate::types::{Entry, KeyMutation};
    use std::collections::BTreeMap;

    fn config(cluster: &MemoryCluster) -> StoreConfig {
        StoreConfig::new(cluster.hosts().to_vec()).with_steering_enabled(false)
    }

    #[tokio::test]
    async fn test_connect_detects_partitioner() {
        let cluster = MemoryCluster::new(&["a"]).with_partitioner(Partitioner::Murmur3);
        let manager = StoreManager::connect(config(&cluster), cluster.connector())
            .await
            .unwrap();
        assert_eq!(manager.partitioner(), Partitioner::Murmur3);
        assert!(!manager.features().ordered_scan);
        assert!(!manager.is_steering());
        manager.close().await;
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let cluster = MemoryCluster::new(&["a"]);
        let err = StoreManager::connect(StoreConfig::new(vec![]), cluster.connector())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_fails_temporarily_when_unreachable() {
        let cluster = MemoryCluster::new(&["a"]);
        cluster.set_host_down("a", true);
        let err = StoreManager::connect(config(&cluster), cluster.connector())
            .await
            .unwrap_err();
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn test_open_store_creates_column_family_once() {
        let cluster = MemoryCluster::new(&["a"]);
        let manager = StoreManager::connect(config(&cluster), cluster.connector())
            .await
            .unwrap();

        let store = manager.open_store("edgestore").await.unwrap();
        assert_eq!(store.name(), "edgestore");
        let changes = cluster.schema_changes();
        manager.open_store("edgestore").await.unwrap();
        assert_eq!(cluster.schema_changes(), changes);

        let cf = cluster.column_family("titan", "edgestore").unwrap();
        assert_eq!(cf.caching.as_deref(), Some("keys_only"));
        assert_eq!(manager.metrics().open_stores.get(), 1);
    }

    #[tokio::test]
    async fn test_mutate_many_uses_write_consistency() {
        let cluster = MemoryCluster::new(&["a"]);
        let manager = StoreManager::connect(config(&cluster), cluster.connector())
            .await
            .unwrap();
        manager.open_store("edgestore").await.unwrap();

        let mut by_key = BTreeMap::new();
        by_key.insert(
            Bytes::from_static(b"k"),
            KeyMutation::additions(vec![Entry::new("c", "v")]),
        );
        let mut mutations = StoreMutations::new();
        mutations.insert("edgestore".to_string(), by_key);

        let tx = StoreTransaction::new(ConsistencyLevel::One, ConsistencyLevel::All);
        manager.mutate_many(&mutations, &tx).await.unwrap();

        let batches = cluster.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].consistency, ConsistencyLevel::All);
        assert_eq!(batches[0].keyspace, "titan");
        assert_eq!(
            cluster.value("titan", "edgestore", b"k", b"c"),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(manager.metrics().columns_written.get(["edgestore"]), 1);
    }

    #[tokio::test]
    async fn test_empty_mutations_send_nothing() {
        let cluster = MemoryCluster::new(&["a"]);
        let manager = StoreManager::connect(config(&cluster), cluster.connector())
            .await
            .unwrap();
        manager
            .mutate_many(&StoreMutations::new(), &manager.begin_transaction())
            .await
            .unwrap();
        assert!(cluster.batches().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_work() {
        let cluster = MemoryCluster::new(&["a"]);
        let manager = StoreManager::connect(config(&cluster), cluster.connector())
            .await
            .unwrap();
        manager.close().await;
        manager.close().await;
        let err = manager.open_store("edgestore").await.unwrap_err();
        assert!(matches!(err, Error::PoolShutdown));
    }
}
