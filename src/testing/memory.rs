//! In-memory column store cluster.
//!
//! Every node shares one copy of the data; nodes differ only in whether they
//! are reachable. Writes resolve by last-write-wins on the column timestamp,
//! with a delete winning a timestamp tie, which is what the remote store does.
//!
//! Faults are injected per operation name (`"connect"`, `"batch_mutate"`,
//! `"describe_token_map"`, ...) with [`MemoryCluster::fail_next`], and schema
//! convergence can be delayed with [`MemoryCluster::set_schema_lag`].

use crate::client::{
    Column, ColumnFamilyDef, ColumnMutation, ColumnStoreClient, Connector, KeyspaceDef,
    WireBatch, UNREACHABLE_VERSION,
};
use crate::error::{ClientError, ClientResult};
use crate::pool::EndpointTarget;
use crate::types::{ConsistencyLevel, Partitioner, SYSTEM_KEYSPACE};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Cell {
    value: Option<Bytes>,
    timestamp: i64,
}

type Rows = BTreeMap<Bytes, BTreeMap<Bytes, Cell>>;

#[derive(Debug)]
struct SchemaState {
    keyspaces: BTreeMap<String, KeyspaceDef>,
    version: String,
    previous_version: String,
    lag_per_change: u32,
    lag_remaining: u32,
    changes: usize,
}

impl SchemaState {
    fn bump(&mut self) -> String {
        self.previous_version = std::mem::replace(&mut self.version, Uuid::new_v4().to_string());
        self.lag_remaining = self.lag_per_change;
        self.changes += 1;
        self.version.clone()
    }
}

/// A batch as received by the cluster.
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub host: String,
    pub keyspace: String,
    pub consistency: ConsistencyLevel,
    pub batch: WireBatch,
}

struct ClusterState {
    hosts: Vec<String>,
    partitioner: Mutex<Partitioner>,
    schema: Mutex<SchemaState>,
    data: Mutex<HashMap<(String, String), Rows>>,
    token_map: Mutex<BTreeMap<String, String>>,
    down: Mutex<HashSet<String>>,
    failpoints: Mutex<HashMap<String, VecDeque<ClientError>>>,
    racing_creates: AtomicUsize,
    session_epoch: AtomicU64,
    opened: Mutex<HashMap<String, usize>>,
    open_sessions: AtomicUsize,
    batches: Mutex<Vec<RecordedBatch>>,
}

impl ClusterState {
    fn take_failure(&self, op: &str) -> ClientResult<()> {
        let mut failpoints = self.failpoints.lock();
        match failpoints.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => {
                trace!(op, error = %err, "Failpoint triggered");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Consume one queued lost create race, if any.
    fn take_race(&self) -> bool {
        self.racing_creates
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn is_down(&self, host: &str) -> bool {
        self.down.lock().contains(host)
    }

    fn column_family_exists(&self, keyspace: &str, cf: &str) -> bool {
        self.schema
            .lock()
            .keyspaces
            .get(keyspace)
            .is_some_and(|ks| ks.has_column_family(cf))
    }

    fn apply(&self, keyspace: &str, cf: &str, key: &Bytes, mutation: &ColumnMutation) {
        let mut data = self.data.lock();
        let row = data
            .entry((keyspace.to_string(), cf.to_string()))
            .or_default()
            .entry(key.clone())
            .or_default();
        match mutation {
            ColumnMutation::Insert(column) => {
                let newer = row
                    .get(&column.name)
                    .map_or(true, |cell| column.timestamp > cell.timestamp);
                if newer {
                    row.insert(
                        column.name.clone(),
                        Cell {
                            value: Some(column.value.clone()),
                            timestamp: column.timestamp,
                        },
                    );
                }
            }
            ColumnMutation::Delete { column, timestamp } => {
                let newer = row
                    .get(column)
                    .map_or(true, |cell| *timestamp >= cell.timestamp);
                if newer {
                    row.insert(
                        column.clone(),
                        Cell {
                            value: None,
                            timestamp: *timestamp,
                        },
                    );
                }
            }
        }
    }
}

/// A multi-node in-memory cluster.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl MemoryCluster {
    /// Create a byte-ordered cluster with the given node hostnames.
    pub fn new(hosts: &[&str]) -> Self {
        let version = Uuid::new_v4().to_string();
        Self {
            state: Arc::new(ClusterState {
                hosts: hosts.iter().map(|h| h.to_string()).collect(),
                partitioner: Mutex::new(Partitioner::ByteOrdered),
                schema: Mutex::new(SchemaState {
                    keyspaces: BTreeMap::new(),
                    previous_version: version.clone(),
                    version,
                    lag_per_change: 0,
                    lag_remaining: 0,
                    changes: 0,
                }),
                data: Mutex::new(HashMap::new()),
                token_map: Mutex::new(BTreeMap::new()),
                down: Mutex::new(HashSet::new()),
                failpoints: Mutex::new(HashMap::new()),
                racing_creates: AtomicUsize::new(0),
                session_epoch: AtomicU64::new(0),
                opened: Mutex::new(HashMap::new()),
                open_sessions: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Use a different partitioner.
    pub fn with_partitioner(self, partitioner: Partitioner) -> Self {
        *self.state.partitioner.lock() = partitioner;
        self
    }

    /// A connector opening sessions on this cluster.
    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            state: self.state.clone(),
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.state.hosts
    }

    /// Replace the token map (token string -> endpoint).
    pub fn set_token_map<I, T, E>(&self, entries: I)
    where
        I: IntoIterator<Item = (T, E)>,
        T: Into<String>,
        E: Into<String>,
    {
        *self.state.token_map.lock() = entries
            .into_iter()
            .map(|(t, e)| (t.into(), e.into()))
            .collect();
    }

    /// After each schema change, report disagreement for the next `polls`
    /// schema-version queries.
    pub fn set_schema_lag(&self, polls: u32) {
        self.state.schema.lock().lag_per_change = polls;
    }

    /// Make the next call of `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: &str, err: ClientError) {
        self.state
            .failpoints
            .lock()
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    /// Make the next keyspace or column family create lose a race: another
    /// client's identical definition lands first and the caller gets
    /// `AlreadyExists`.
    pub fn race_next_create(&self) {
        self.state.racing_creates.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark a host unreachable (or reachable again).
    pub fn set_host_down(&self, host: &str, down: bool) {
        let mut hosts = self.state.down.lock();
        if down {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    /// Invalidate every session opened so far.
    pub fn kill_sessions(&self) {
        self.state.session_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Sessions ever opened to `host`.
    pub fn connections_opened(&self, host: &str) -> usize {
        self.state.opened.lock().get(host).copied().unwrap_or(0)
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::Acquire)
    }

    /// Create a keyspace directly, without schema lag.
    pub fn create_keyspace(&self, name: &str) {
        self.state
            .schema
            .lock()
            .keyspaces
            .entry(name.to_string())
            .or_insert_with(|| KeyspaceDef {
                name: name.to_string(),
                strategy_class: "org.apache.cassandra.locator.SimpleStrategy".to_string(),
                strategy_options: BTreeMap::new(),
                column_families: Vec::new(),
            });
    }

    pub fn keyspace(&self, name: &str) -> Option<KeyspaceDef> {
        self.state.schema.lock().keyspaces.get(name).cloned()
    }

    pub fn column_family(&self, keyspace: &str, name: &str) -> Option<ColumnFamilyDef> {
        self.keyspace(keyspace)?
            .column_families
            .into_iter()
            .find(|cf| cf.name == name)
    }

    /// Number of schema changes applied.
    pub fn schema_changes(&self) -> usize {
        self.state.schema.lock().changes
    }

    /// Live value of a column, if any.
    pub fn value(&self, keyspace: &str, cf: &str, key: &[u8], column: &[u8]) -> Option<Bytes> {
        self.cell(keyspace, cf, key, column).and_then(|(value, _)| value)
    }

    /// Value (or tombstone) and timestamp of a column.
    pub fn cell(
        &self,
        keyspace: &str,
        cf: &str,
        key: &[u8],
        column: &[u8],
    ) -> Option<(Option<Bytes>, i64)> {
        let data = self.state.data.lock();
        let cell = data
            .get(&(keyspace.to_string(), cf.to_string()))?
            .get(key)?
            .get(column)?;
        Some((cell.value.clone(), cell.timestamp))
    }

    /// Live rows in a column family.
    pub fn row_count(&self, keyspace: &str, cf: &str) -> usize {
        self.state
            .data
            .lock()
            .get(&(keyspace.to_string(), cf.to_string()))
            .map_or(0, |rows| {
                rows.values()
                    .filter(|row| row.values().any(|c| c.value.is_some()))
                    .count()
            })
    }

    /// Batches received so far.
    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.state.batches.lock().clone()
    }
}

/// Opens [`MemorySession`]s on a [`MemoryCluster`].
pub struct MemoryConnector {
    state: Arc<ClusterState>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &EndpointTarget) -> ClientResult<Box<dyn ColumnStoreClient>> {
        self.state.take_failure("connect")?;
        if !self.state.hosts.contains(&target.hostname) {
            return Err(ClientError::Transport(format!("unknown host {}", target.hostname)));
        }
        if self.state.is_down(&target.hostname) {
            return Err(ClientError::Transport(format!(
                "connection refused by {}",
                target
            )));
        }

        *self
            .state
            .opened
            .lock()
            .entry(target.hostname.clone())
            .or_insert(0) += 1;
        self.state.open_sessions.fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            host: target.hostname.clone(),
            keyspace: None,
            epoch: self.state.session_epoch.load(Ordering::Acquire),
            open: true,
        }))
    }
}

/// One session on a [`MemoryCluster`] node.
pub struct MemorySession {
    state: Arc<ClusterState>,
    host: String,
    keyspace: Option<String>,
    epoch: u64,
    open: bool,
}

impl MemorySession {
    fn check(&self, op: &str) -> ClientResult<()> {
        if !self.is_open() {
            return Err(ClientError::Transport(format!("session to {} is closed", self.host)));
        }
        self.state.take_failure(op)
    }

    fn current_keyspace(&self) -> ClientResult<String> {
        self.keyspace
            .clone()
            .filter(|ks| ks != SYSTEM_KEYSPACE)
            .ok_or_else(|| ClientError::InvalidRequest("no keyspace selected".into()))
    }

    fn require_column_family(&self, keyspace: &str, cf: &str) -> ClientResult<()> {
        if self.state.column_family_exists(keyspace, cf) {
            Ok(())
        } else {
            Err(ClientError::InvalidRequest(format!(
                "unconfigured column family {}.{}",
                keyspace, cf
            )))
        }
    }
}

#[async_trait]
impl ColumnStoreClient for MemorySession {
    async fn ping(&mut self) -> ClientResult<()> {
        self.check("ping")
    }

    fn is_open(&self) -> bool {
        self.open
            && self.epoch == self.state.session_epoch.load(Ordering::Acquire)
            && !self.state.is_down(&self.host)
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.state.open_sessions.fetch_sub(1, Ordering::AcqRel);
        }
    }

    async fn set_keyspace(&mut self, keyspace: &str) -> ClientResult<()> {
        self.check("set_keyspace")?;
        if keyspace != SYSTEM_KEYSPACE && !self.state.schema.lock().keyspaces.contains_key(keyspace) {
            return Err(ClientError::NotFound(format!("keyspace {}", keyspace)));
        }
        self.keyspace = Some(keyspace.to_string());
        Ok(())
    }

    async fn describe_keyspace(&mut self, keyspace: &str) -> ClientResult<KeyspaceDef> {
        self.check("describe_keyspace")?;
        self.state
            .schema
            .lock()
            .keyspaces
            .get(keyspace)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("keyspace {}", keyspace)))
    }

    async fn add_keyspace(&mut self, def: KeyspaceDef) -> ClientResult<String> {
        self.check("add_keyspace")?;
        if def.name.is_empty() {
            return Err(ClientError::InvalidRequest("keyspace name must not be empty".into()));
        }
        let mut schema = self.state.schema.lock();
        if !schema.keyspaces.contains_key(&def.name) && self.state.take_race() {
            let name = def.name.clone();
            schema.keyspaces.insert(name.clone(), def);
            schema.bump();
            return Err(ClientError::AlreadyExists(format!("keyspace {}", name)));
        }
        if schema.keyspaces.contains_key(&def.name) {
            return Err(ClientError::AlreadyExists(format!("keyspace {}", def.name)));
        }
        schema.keyspaces.insert(def.name.clone(), def);
        Ok(schema.bump())
    }

    async fn add_column_family(&mut self, def: ColumnFamilyDef) -> ClientResult<String> {
        self.check("add_column_family")?;
        if def.name.is_empty() {
            return Err(ClientError::InvalidRequest("column family name must not be empty".into()));
        }
        let mut schema = self.state.schema.lock();
        let keyspace = schema.keyspaces.get_mut(&def.keyspace).ok_or_else(|| {
            ClientError::InvalidRequest(format!("keyspace {} does not exist", def.keyspace))
        })?;
        if keyspace.has_column_family(&def.name) {
            return Err(ClientError::AlreadyExists(format!(
                "column family {}.{}",
                def.keyspace, def.name
            )));
        }
        let lost_race = self.state.take_race();
        let name = format!("{}.{}", def.keyspace, def.name);
        keyspace.column_families.push(def);
        let version = schema.bump();
        if lost_race {
            return Err(ClientError::AlreadyExists(format!("column family {}", name)));
        }
        Ok(version)
    }

    async fn describe_schema_versions(&mut self) -> ClientResult<BTreeMap<String, Vec<String>>> {
        self.check("describe_schema_versions")?;
        let mut schema = self.state.schema.lock();
        let mut versions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let lagging = schema.lag_remaining > 0;
        if lagging {
            schema.lag_remaining -= 1;
        }
        for (i, host) in self.state.hosts.iter().enumerate() {
            let version = if self.state.is_down(host) {
                UNREACHABLE_VERSION.to_string()
            } else if lagging && i > 0 {
                schema.previous_version.clone()
            } else {
                schema.version.clone()
            };
            versions.entry(version).or_default().push(host.clone());
        }
        if lagging && self.state.hosts.len() < 2 {
            versions
                .entry(schema.previous_version.clone())
                .or_default()
                .push("lagging-replica".to_string());
        }
        Ok(versions)
    }

    async fn describe_partitioner(&mut self) -> ClientResult<String> {
        self.check("describe_partitioner")?;
        Ok(self.state.partitioner.lock().class_name().to_string())
    }

    async fn describe_token_map(&mut self) -> ClientResult<BTreeMap<String, String>> {
        self.check("describe_token_map")?;
        Ok(self.state.token_map.lock().clone())
    }

    async fn batch_mutate(
        &mut self,
        batch: WireBatch,
        consistency: ConsistencyLevel,
    ) -> ClientResult<()> {
        self.check("batch_mutate")?;
        let keyspace = self.current_keyspace()?;
        for families in batch.values() {
            for cf in families.keys() {
                self.require_column_family(&keyspace, cf)?;
            }
        }
        for (key, families) in &batch {
            for (cf, mutations) in families {
                for mutation in mutations {
                    self.state.apply(&keyspace, cf, key, mutation);
                }
            }
        }
        self.state.batches.lock().push(RecordedBatch {
            host: self.host.clone(),
            keyspace,
            consistency,
            batch,
        });
        Ok(())
    }

    async fn get(
        &mut self,
        key: &[u8],
        column_family: &str,
        column: &[u8],
        _consistency: ConsistencyLevel,
    ) -> ClientResult<Column> {
        self.check("get")?;
        let keyspace = self.current_keyspace()?;
        self.require_column_family(&keyspace, column_family)?;
        let data = self.state.data.lock();
        let cell = data
            .get(&(keyspace, column_family.to_string()))
            .and_then(|rows| rows.get(key))
            .and_then(|row| row.get(column));
        match cell {
            Some(Cell {
                value: Some(value),
                timestamp,
            }) => Ok(Column::new(
                Bytes::copy_from_slice(column),
                value.clone(),
                *timestamp,
            )),
            _ => Err(ClientError::NotFound("column".into())),
        }
    }

    async fn insert(
        &mut self,
        key: &[u8],
        column_family: &str,
        column: Column,
        _consistency: ConsistencyLevel,
    ) -> ClientResult<()> {
        self.check("insert")?;
        let keyspace = self.current_keyspace()?;
        self.require_column_family(&keyspace, column_family)?;
        self.state.apply(
            &keyspace,
            column_family,
            &Bytes::copy_from_slice(key),
            &ColumnMutation::Insert(column),
        );
        Ok(())
    }

    async fn truncate(&mut self, column_family: &str) -> ClientResult<()> {
        self.check("truncate")?;
        let keyspace = self.current_keyspace()?;
        self.require_column_family(&keyspace, column_family)?;
        self.state
            .data
            .lock()
            .remove(&(keyspace, column_family.to_string()));
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target(host: &str) -> EndpointTarget {
        EndpointTarget {
            hostname: host.to_string(),
            port: 9160,
            timeout: Duration::from_secs(1),
            frame_size: 1024,
            max_message_size: 1024,
        }
    }

    async fn session(cluster: &MemoryCluster, keyspace: &str) -> Box<dyn ColumnStoreClient> {
        let mut s = cluster.connector().connect(&target("a")).await.unwrap();
        s.set_keyspace(keyspace).await.unwrap();
        s
    }

    fn setup() -> MemoryCluster {
        let cluster = MemoryCluster::new(&["a", "b"]);
        cluster.create_keyspace("ks");
        let mut schema = cluster.state.schema.lock();
        schema
            .keyspaces
            .get_mut("ks")
            .unwrap()
            .column_families
            .push(ColumnFamilyDef::new("ks", "cf"));
        drop(schema);
        cluster
    }

    fn one(key: &'static [u8], mutation: ColumnMutation) -> WireBatch {
        let mut batch = WireBatch::new();
        batch
            .entry(Bytes::from_static(key))
            .or_default()
            .insert("cf".to_string(), vec![mutation]);
        batch
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cluster = setup();
        let mut s = session(&cluster, "ks").await;

        let newer = ColumnMutation::Insert(Column::new("c", "new", 20));
        let older = ColumnMutation::Insert(Column::new("c", "old", 10));
        s.batch_mutate(one(b"k", newer), ConsistencyLevel::One).await.unwrap();
        s.batch_mutate(one(b"k", older), ConsistencyLevel::One).await.unwrap();

        assert_eq!(cluster.value("ks", "cf", b"k", b"c"), Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_delete_wins_timestamp_tie() {
        let cluster = setup();
        let mut s = session(&cluster, "ks").await;

        let insert = ColumnMutation::Insert(Column::new("c", "v", 5));
        let delete = ColumnMutation::Delete {
            column: Bytes::from_static(b"c"),
            timestamp: 5,
        };
        s.batch_mutate(one(b"k", insert), ConsistencyLevel::One).await.unwrap();
        s.batch_mutate(one(b"k", delete), ConsistencyLevel::One).await.unwrap();

        assert_eq!(cluster.value("ks", "cf", b"k", b"c"), None);
        assert_eq!(cluster.row_count("ks", "cf"), 0);
    }

    #[tokio::test]
    async fn test_unknown_column_family_rejected() {
        let cluster = setup();
        let mut s = session(&cluster, "ks").await;
        let mut batch = WireBatch::new();
        batch
            .entry(Bytes::from_static(b"k"))
            .or_default()
            .insert("missing".to_string(), Vec::new());
        let err = s.batch_mutate(batch, ConsistencyLevel::One).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_schema_lag_reports_disagreement() {
        let cluster = MemoryCluster::new(&["a", "b"]);
        cluster.set_schema_lag(2);
        let mut s = cluster.connector().connect(&target("a")).await.unwrap();

        let def = KeyspaceDef {
            name: "ks".into(),
            strategy_class: "SimpleStrategy".into(),
            strategy_options: BTreeMap::new(),
            column_families: Vec::new(),
        };
        let version = s.add_keyspace(def).await.unwrap();

        assert_eq!(s.describe_schema_versions().await.unwrap().len(), 2);
        assert_eq!(s.describe_schema_versions().await.unwrap().len(), 2);
        let settled = s.describe_schema_versions().await.unwrap();
        assert_eq!(settled.len(), 1);
        assert!(settled.contains_key(&version));
    }

    #[tokio::test]
    async fn test_failpoints_and_killed_sessions() {
        let cluster = setup();
        cluster.fail_next("ping", ClientError::TimedOut);
        let mut s = session(&cluster, "ks").await;

        assert_eq!(s.ping().await, Err(ClientError::TimedOut));
        assert!(s.ping().await.is_ok());

        cluster.kill_sessions();
        assert!(!s.is_open());
        assert!(matches!(s.ping().await, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn test_lost_create_race_applies_definition() {
        let cluster = setup();
        let mut s = session(&cluster, SYSTEM_KEYSPACE).await;
        let changes = cluster.schema_changes();

        cluster.race_next_create();
        let def = ColumnFamilyDef::new("ks", "raced");
        let err = s.add_column_family(def.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyExists(_)));
        assert!(cluster.column_family("ks", "raced").is_some());
        assert_eq!(cluster.schema_changes(), changes + 1);

        // The race is spent; a repeat sees the plain duplicate.
        let err = s.add_column_family(def).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyExists(_)));
        assert_eq!(cluster.schema_changes(), changes + 1);
    }

    #[tokio::test]
    async fn test_session_accounting() {
        let cluster = setup();
        let s1 = cluster.connector().connect(&target("a")).await.unwrap();
        let mut s2 = cluster.connector().connect(&target("b")).await.unwrap();
        assert_eq!(cluster.open_sessions(), 2);

        s2.close();
        drop(s1);
        assert_eq!(cluster.open_sessions(), 0);
        assert_eq!(cluster.connections_opened("a"), 1);
        assert_eq!(cluster.connections_opened("b"), 1);

        assert!(cluster.connector().connect(&target("zz")).await.is_err());
    }
}
