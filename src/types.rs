//! Core types shared between the graph-facing API and the remote store.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the reserved system namespace every node carries.
pub const SYSTEM_KEYSPACE: &str = "system";

/// A column/value pair to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub column: Bytes,
    pub value: Bytes,
}

impl Entry {
    /// Create a new entry.
    pub fn new(column: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Additions and deletions for a single row key in a single store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMutation {
    additions: Vec<Entry>,
    deletions: Vec<Bytes>,
}

impl KeyMutation {
    /// Create a mutation from additions and deleted column names.
    pub fn new(additions: Vec<Entry>, deletions: Vec<Bytes>) -> Self {
        Self {
            additions,
            deletions,
        }
    }

    /// Mutation consisting only of additions.
    pub fn additions(additions: Vec<Entry>) -> Self {
        Self::new(additions, Vec::new())
    }

    /// Mutation consisting only of deletions.
    pub fn deletions(deletions: Vec<Bytes>) -> Self {
        Self::new(Vec::new(), deletions)
    }

    pub fn has_additions(&self) -> bool {
        !self.additions.is_empty()
    }

    pub fn has_deletions(&self) -> bool {
        !self.deletions.is_empty()
    }

    pub fn get_additions(&self) -> &[Entry] {
        &self.additions
    }

    pub fn get_deletions(&self) -> &[Bytes] {
        &self.deletions
    }

    /// Add a column/value pair.
    pub fn add(&mut self, entry: Entry) {
        self.additions.push(entry);
    }

    /// Delete a column.
    pub fn delete(&mut self, column: impl Into<Bytes>) {
        self.deletions.push(column.into());
    }

    /// Number of column operations this mutation expands to.
    pub fn len(&self) -> usize {
        self.additions.len() + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutations grouped by store name, then by row key.
pub type StoreMutations = BTreeMap<String, BTreeMap<Bytes, KeyMutation>>;

/// Replica acknowledgement level for reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    One,
    Two,
    Three,
    Quorum,
    LocalQuorum,
    EachQuorum,
    All,
    Any,
}

impl Default for ConsistencyLevel {
    fn default() -> Self {
        ConsistencyLevel::Quorum
    }
}

/// Transaction context handed to the adapter by the graph engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTransaction {
    read_consistency: ConsistencyLevel,
    write_consistency: ConsistencyLevel,
}

impl StoreTransaction {
    pub fn new(read_consistency: ConsistencyLevel, write_consistency: ConsistencyLevel) -> Self {
        Self {
            read_consistency,
            write_consistency,
        }
    }

    pub fn read_consistency(&self) -> ConsistencyLevel {
        self.read_consistency
    }

    pub fn write_consistency(&self) -> ConsistencyLevel {
        self.write_consistency
    }
}

impl Default for StoreTransaction {
    fn default() -> Self {
        Self::new(ConsistencyLevel::Quorum, ConsistencyLevel::Quorum)
    }
}

/// Partitioning scheme reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partitioner {
    /// Keys placed by raw byte order; tokens are hex-encoded bytes.
    ByteOrdered,
    /// Keys placed by string order; tokens are the key strings.
    OrderPreserving,
    /// MD5-hash placement.
    Random,
    /// Murmur3-hash placement.
    Murmur3,
}

impl Partitioner {
    /// Map a partitioner class name to a known partitioner.
    pub fn from_class_name(name: &str) -> Result<Self> {
        let simple = name.rsplit('.').next().unwrap_or(name);
        match simple {
            "ByteOrderedPartitioner" => Ok(Partitioner::ByteOrdered),
            "OrderPreservingPartitioner" => Ok(Partitioner::OrderPreserving),
            "RandomPartitioner" => Ok(Partitioner::Random),
            "Murmur3Partitioner" => Ok(Partitioner::Murmur3),
            _ => Err(Error::Permanent(format!("unsupported partitioner: {}", name))),
        }
    }

    /// Fully-qualified class name as reported by the cluster.
    pub fn class_name(&self) -> &'static str {
        match self {
            Partitioner::ByteOrdered => "org.apache.cassandra.dht.ByteOrderedPartitioner",
            Partitioner::OrderPreserving => "org.apache.cassandra.dht.OrderPreservingPartitioner",
            Partitioner::Random => "org.apache.cassandra.dht.RandomPartitioner",
            Partitioner::Murmur3 => "org.apache.cassandra.dht.Murmur3Partitioner",
        }
    }

    /// Whether row keys map onto the ring in key order.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Partitioner::ByteOrdered | Partitioner::OrderPreserving)
    }

    /// Decode a token string from the token map into its ordered byte form.
    ///
    /// Returns `None` for hash partitioners, whose tokens are not comparable
    /// with row keys.
    pub fn decode_token(&self, token: &str) -> Option<Bytes> {
        match self {
            Partitioner::ByteOrdered => hex::decode(token).ok().map(Bytes::from),
            Partitioner::OrderPreserving => Some(Bytes::copy_from_slice(token.as_bytes())),
            Partitioner::Random | Partitioner::Murmur3 => None,
        }
    }
}

/// Capabilities advertised to the graph engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreFeatures {
    pub batch_mutation: bool,
    pub ordered_scan: bool,
    pub key_consistent: bool,
    pub locking: bool,
}

impl StoreFeatures {
    pub fn for_partitioner(partitioner: Partitioner) -> Self {
        Self {
            batch_mutation: true,
            ordered_scan: partitioner.is_ordered(),
            key_consistent: true,
            locking: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitioner_from_class_name() {
        assert_eq!(
            Partitioner::from_class_name("org.apache.cassandra.dht.ByteOrderedPartitioner").unwrap(),
            Partitioner::ByteOrdered
        );
        assert_eq!(
            Partitioner::from_class_name("RandomPartitioner").unwrap(),
            Partitioner::Random
        );
        assert!(Partitioner::from_class_name("org.example.Mystery").is_err());
    }

    #[test]
    fn test_partitioner_ordering() {
        assert!(Partitioner::ByteOrdered.is_ordered());
        assert!(Partitioner::OrderPreserving.is_ordered());
        assert!(!Partitioner::Murmur3.is_ordered());
        assert!(!StoreFeatures::for_partitioner(Partitioner::Random).ordered_scan);
    }

    #[test]
    fn test_decode_token() {
        assert_eq!(
            Partitioner::ByteOrdered.decode_token("0a10"),
            Some(Bytes::from_static(&[0x0a, 0x10]))
        );
        assert_eq!(Partitioner::ByteOrdered.decode_token("zz"), None);
        assert_eq!(
            Partitioner::OrderPreserving.decode_token("m"),
            Some(Bytes::from_static(b"m"))
        );
        assert_eq!(Partitioner::Murmur3.decode_token("-42"), None);
    }

    #[test]
    fn test_key_mutation() {
        let mut m = KeyMutation::default();
        assert!(m.is_empty());
        m.add(Entry::new("c", "v"));
        m.delete("d");
        assert!(m.has_additions());
        assert!(m.has_deletions());
        assert_eq!(m.len(), 2);
    }
}
