//! Graph storage adapter for a ring-partitioned wide-column store.
//!
//! This crate exposes a key/column/value storage layer on top of a remote
//! column store whose rows are spread over a token ring:
//! - **Keyed connection pool** with generation-stamped connections so the
//!   whole pool can be pointed at a new endpoint at any time
//! - **Ring tracking** of the token map for key-to-owner lookups
//! - **Hotspot steering** that moves connections toward the node owning the
//!   most heavily written token range
//! - **Schema management** that creates keyspaces and column families on
//!   demand and waits for the cluster to agree on the result
//!
//! # Example
//!
//! ```rust,no_run
//! use ringstore::{Entry, KeyMutation, StoreConfig, StoreManager, StoreMutations, TcpConnector};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoreConfig::new(vec!["10.0.0.1".into(), "10.0.0.2".into()])
//!         .with_keyspace("titan")
//!         .with_replication_factor(3);
//!
//!     let manager = StoreManager::connect(config, Arc::new(TcpConnector::new())).await?;
//!     let edges = manager.open_store("edgestore").await?;
//!
//!     // Single-key writes go through the store handle
//!     let tx = manager.begin_transaction();
//!     edges
//!         .insert(b"v1", Bytes::from_static(b"name"), Bytes::from_static(b"hercules"), &tx)
//!         .await?;
//!
//!     // Multi-store batches go through the manager
//!     let mut mutations = StoreMutations::new();
//!     mutations.entry("edgestore".to_string()).or_default().insert(
//!         Bytes::from_static(b"v2"),
//!         KeyMutation::new(vec![Entry::new("age", "30")], vec![]),
//!     );
//!     manager.mutate_many(&mutations, &tx).await?;
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Graph Database Layer             │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │              StoreManager API               │
//! │  • open_store(name) -> KeyColumnValueStore  │
//! │  • mutate_many(mutations, tx)               │
//! │  • get/set_config_property, clear_storage   │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼────────────────┐
//!     ▼               ▼                ▼
//! ┌─────────┐   ┌────────────┐   ┌───────────┐
//! │ Schema  │   │ Connection │◄──│ Steering  │
//! │ Manager │   │    Pool    │   │ Ring+Hot  │
//! └─────────┘   └────────────┘   └───────────┘
//!                     │
//!                     ▼
//!          ColumnStoreClient (TCP)
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: every batch carries a deletion timestamp and a strictly
//!   larger addition timestamp, so an addition in the same batch always
//!   wins over a deletion of the same column
//! - **Reads**: issued at the transaction's read consistency level
//! - **Config properties**: always read and written at `QUORUM`

pub mod client;
pub mod config;
pub mod error;
pub mod index;
pub mod metrics;
pub mod mutation;
pub mod network;
pub mod partitioning;
pub mod pool;
pub mod schema;
pub mod steering;
pub mod store;
pub mod testing;
pub mod types;

pub use config::{PoolConfig, SchemaConfig, SteeringConfig, StoreConfig};
pub use error::{ClientError, Error, ErrorKind, NetworkError, Result};
pub use store::{KeyColumnValueStore, StoreManager};
pub use types::{
    ConsistencyLevel, Entry, KeyMutation, Partitioner, StoreFeatures, StoreMutations,
    StoreTransaction,
};

// Re-export client types
pub use client::{Column, ColumnFamilyDef, ColumnStoreClient, Connector, KeyspaceDef};

// Re-export pool types
pub use pool::{ConnectionFactory, ConnectionPool, EndpointTarget, PoolStats};

// Re-export partitioning types
pub use partitioning::{HotspotTracker, RingSnapshot, RingTracker};

// Re-export index types
pub use index::{IndexProvider, IndexQuery, Predicate};

// Re-export metrics types
pub use metrics::{MetricsSnapshot, StoreMetrics};

// Re-export network types
pub use network::{ColumnStoreServer, TcpConnector};
