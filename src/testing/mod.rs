//! Testing utilities for the storage adapter.
//!
//! [`MemoryCluster`] stands in for the remote column store: a set of named
//! nodes sharing one last-write-wins data set, with a configurable token map,
//! partitioner, schema convergence lag and per-operation fault injection.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        MemoryCluster                          │
//! │   nodes: a, b, c        token map: T1 -> a, T2 -> b, ...      │
//! │   schema versions       failpoints: "batch_mutate" -> error   │
//! └───────────────────────────────────────────────────────────────┘
//!          ▲                                   ▲
//!          │ MemoryConnector                   │ MemoryConnector
//!          │                                   │
//! ┌─────────────────┐                 ┌─────────────────────────┐
//! │  StoreManager   │                 │   ColumnStoreServer     │
//! │  (in-process)   │                 │   (over TCP)            │
//! └─────────────────┘                 └─────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ringstore::testing::MemoryCluster;
//! use ringstore::{StoreConfig, StoreManager};
//!
//! # async fn run() -> ringstore::Result<()> {
//! let cluster = MemoryCluster::new(&["a", "b"]);
//! cluster.set_token_map([("40", "a"), ("c0", "b")]);
//!
//! let config = StoreConfig::new(vec!["a".to_string()]);
//! let manager = StoreManager::connect(config, cluster.connector()).await?;
//! let store = manager.open_store("edgestore").await?;
//! # let _ = store;
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

mod memory;

#[cfg(test)]
mod utils;

pub use memory::{MemoryCluster, MemoryConnector, MemorySession, RecordedBatch};
