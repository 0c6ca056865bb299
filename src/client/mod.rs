//! The remote column store capability.
//!
//! The adapter never speaks the store's RPC protocol directly. It talks to a
//! [`ColumnStoreClient`] session created by a [`Connector`] for the endpoint
//! the connection factory currently targets. [`crate::network::TcpConnector`]
//! is the framed TCP implementation; [`crate::testing::MemoryConnector`] is an
//! in-process cluster used by tests.

use crate::error::ClientResult;
use crate::pool::EndpointTarget;
use crate::types::ConsistencyLevel;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema-version key reported for nodes that could not be reached.
pub const UNREACHABLE_VERSION: &str = "UNREACHABLE";

/// A stored column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: Bytes,
    pub value: Bytes,
    pub timestamp: i64,
}

impl Column {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            timestamp,
        }
    }
}

/// A single column operation inside a wire batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnMutation {
    /// Write a column with a value and timestamp.
    Insert(Column),
    /// Delete a column by name as of a timestamp.
    Delete { column: Bytes, timestamp: i64 },
}

impl ColumnMutation {
    pub fn timestamp(&self) -> i64 {
        match self {
            ColumnMutation::Insert(c) => c.timestamp,
            ColumnMutation::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn column_name(&self) -> &Bytes {
        match self {
            ColumnMutation::Insert(c) => &c.name,
            ColumnMutation::Delete { column, .. } => column,
        }
    }
}

/// Row key -> column family -> ordered column operations.
pub type WireBatch = BTreeMap<Bytes, BTreeMap<String, Vec<ColumnMutation>>>;

/// Column family definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamilyDef {
    pub keyspace: String,
    pub name: String,
    pub comparator_type: String,
    pub compression_options: BTreeMap<String, String>,
    pub caching: Option<String>,
}

impl ColumnFamilyDef {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
            comparator_type: crate::schema::BYTES_COMPARATOR.to_string(),
            compression_options: BTreeMap::new(),
            caching: None,
        }
    }
}

/// Keyspace definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceDef {
    pub name: String,
    pub strategy_class: String,
    pub strategy_options: BTreeMap<String, String>,
    pub column_families: Vec<ColumnFamilyDef>,
}

impl KeyspaceDef {
    /// Whether the keyspace contains a column family with this name.
    pub fn has_column_family(&self, name: &str) -> bool {
        self.column_families.iter().any(|cf| cf.name == name)
    }
}

/// One session with one remote endpoint.
///
/// A session carries a current keyspace, so it is used by exactly one caller
/// at a time (`&mut self`).
#[async_trait]
pub trait ColumnStoreClient: Send + Sync {
    /// Liveness probe.
    async fn ping(&mut self) -> ClientResult<()>;

    /// Whether the session has not been closed locally or by the peer.
    fn is_open(&self) -> bool;

    /// Tear the session down.
    fn close(&mut self);

    /// Select the keyspace later calls operate on.
    async fn set_keyspace(&mut self, keyspace: &str) -> ClientResult<()>;

    async fn describe_keyspace(&mut self, keyspace: &str) -> ClientResult<KeyspaceDef>;

    /// Create a keyspace, returning the new schema version.
    async fn add_keyspace(&mut self, def: KeyspaceDef) -> ClientResult<String>;

    /// Create a column family, returning the new schema version.
    async fn add_column_family(&mut self, def: ColumnFamilyDef) -> ClientResult<String>;

    /// Schema version -> hosts reporting it.
    async fn describe_schema_versions(&mut self) -> ClientResult<BTreeMap<String, Vec<String>>>;

    /// Class name of the cluster partitioner.
    async fn describe_partitioner(&mut self) -> ClientResult<String>;

    /// Range-end token -> owning endpoint.
    async fn describe_token_map(&mut self) -> ClientResult<BTreeMap<String, String>>;

    /// Apply a multi-key batch, atomic per row key.
    async fn batch_mutate(
        &mut self,
        batch: WireBatch,
        consistency: ConsistencyLevel,
    ) -> ClientResult<()>;

    /// Read one column from the current keyspace.
    async fn get(
        &mut self,
        key: &[u8],
        column_family: &str,
        column: &[u8],
        consistency: ConsistencyLevel,
    ) -> ClientResult<Column>;

    /// Write one column into the current keyspace.
    async fn insert(
        &mut self,
        key: &[u8],
        column_family: &str,
        column: Column,
        consistency: ConsistencyLevel,
    ) -> ClientResult<()>;

    /// Remove all data from a column family of the current keyspace.
    async fn truncate(&mut self, column_family: &str) -> ClientResult<()>;
}

/// Opens sessions against an endpoint target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, target: &EndpointTarget) -> ClientResult<Box<dyn ColumnStoreClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_mutation_accessors() {
        let insert = ColumnMutation::Insert(Column::new("a", "1", 7));
        assert_eq!(insert.timestamp(), 7);
        assert_eq!(insert.column_name(), &Bytes::from_static(b"a"));

        let delete = ColumnMutation::Delete {
            column: Bytes::from_static(b"b"),
            timestamp: 3,
        };
        assert_eq!(delete.timestamp(), 3);
        assert_eq!(delete.column_name(), &Bytes::from_static(b"b"));
    }

    #[test]
    fn test_keyspace_has_column_family() {
        let ks = KeyspaceDef {
            name: "titan".into(),
            strategy_class: "SimpleStrategy".into(),
            strategy_options: BTreeMap::new(),
            column_families: vec![ColumnFamilyDef::new("titan", "edgestore")],
        };
        assert!(ks.has_column_family("edgestore"));
        assert!(!ks.has_column_family("vertexindex"));
    }
}
