//! Keyspace and column family bootstrap.
//!
//! Creation is idempotent: a duplicate-create reported by the cluster counts
//! as success once the object is visible. After every change the manager
//! blocks until all reachable nodes report the same schema version.

use crate::client::{ColumnFamilyDef, ColumnStoreClient, KeyspaceDef, UNREACHABLE_VERSION};
use crate::config::SchemaConfig;
use crate::error::{ClientError, Error, Result};
use crate::pool::ConnectionPool;
use crate::types::SYSTEM_KEYSPACE;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Comparator ordering column names as raw bytes.
pub const BYTES_COMPARATOR: &str = "org.apache.cassandra.db.marshal.BytesType";

/// Comparator ordering column names as UTF-8 strings.
pub const UTF8_COMPARATOR: &str = "org.apache.cassandra.db.marshal.UTF8Type";

/// Replication strategy for created keyspaces.
pub const SIMPLE_STRATEGY: &str = "org.apache.cassandra.locator.SimpleStrategy";

const COMPRESSION_CLASS: &str = "SnappyCompressor";
const COMPRESSION_CHUNK_KB: u32 = 64;

/// Caching hint for a column family, chosen by name prefix.
pub fn caching_for(name: &str) -> Option<&'static str> {
    if name.starts_with("edgestore") {
        Some("keys_only")
    } else if name.starts_with("vertexindex") {
        Some("rows_only")
    } else {
        None
    }
}

/// Compression options applied to every created column family.
pub fn compression_options() -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    options.insert("sstable_compression".to_string(), COMPRESSION_CLASS.to_string());
    options.insert("chunk_length_kb".to_string(), COMPRESSION_CHUNK_KB.to_string());
    options
}

/// Definition used when a keyspace has to be created.
pub fn keyspace_def(name: &str, replication_factor: u32) -> KeyspaceDef {
    let mut strategy_options = BTreeMap::new();
    strategy_options.insert("replication_factor".to_string(), replication_factor.to_string());
    KeyspaceDef {
        name: name.to_string(),
        strategy_class: SIMPLE_STRATEGY.to_string(),
        strategy_options,
        column_families: Vec::new(),
    }
}

/// Definition used when a column family has to be created.
pub fn column_family_def(keyspace: &str, name: &str, comparator: &str) -> ColumnFamilyDef {
    ColumnFamilyDef {
        keyspace: keyspace.to_string(),
        name: name.to_string(),
        comparator_type: comparator.to_string(),
        compression_options: compression_options(),
        caching: caching_for(name).map(str::to_string),
    }
}

/// Ensures schema objects exist.
pub struct SchemaManager {
    pool: ConnectionPool,
    replication_factor: u32,
    config: SchemaConfig,
    cancel: CancellationToken,
}

impl SchemaManager {
    pub fn new(
        pool: ConnectionPool,
        replication_factor: u32,
        config: SchemaConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            replication_factor,
            config,
            cancel,
        }
    }

    /// Describe a keyspace, or `None` if it does not exist.
    pub async fn describe_keyspace(&self, name: &str) -> Result<Option<KeyspaceDef>> {
        let mut conn = self.pool.borrow(SYSTEM_KEYSPACE).await?;
        match conn.client_mut().describe_keyspace(name).await {
            Ok(def) => Ok(Some(def)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(Error::temporary(&format!("describe keyspace {}", name), e)),
        }
    }

    /// Make sure keyspace `name` exists, creating it if needed.
    ///
    /// Checks existence with a describe so the borrowed system connection keeps the
    /// system keyspace selected when it goes back to the pool.
    pub async fn ensure_keyspace(&self, name: &str) -> Result<KeyspaceDef> {
        let mut conn = self.pool.borrow(SYSTEM_KEYSPACE).await?;
        let client = conn.client_mut();

        match client.describe_keyspace(name).await {
            Ok(def) => {
                debug!(keyspace = %name, "Keyspace exists");
                return Ok(def);
            }
            Err(ClientError::NotFound(_)) => {}
            Err(e) => {
                return Err(Error::temporary(&format!("describe keyspace {}", name), e));
            }
        }

        info!(keyspace = %name, replication_factor = self.replication_factor, "Creating keyspace");
        match client
            .add_keyspace(keyspace_def(name, self.replication_factor))
            .await
        {
            Ok(version) => {
                debug!(keyspace = %name, %version, "Keyspace created");
            }
            Err(ClientError::AlreadyExists(_)) => {
                debug!(keyspace = %name, "Keyspace created concurrently");
            }
            Err(e @ ClientError::InvalidRequest(_)) => {
                return Err(Error::permanent(&format!("create keyspace {}", name), e));
            }
            Err(e) => {
                return Err(Error::temporary(&format!("create keyspace {}", name), e));
            }
        }
        self.wait_for_schema_agreement(client).await?;

        client
            .describe_keyspace(name)
            .await
            .map_err(|e| Error::temporary(&format!("describe keyspace {}", name), e))
    }

    /// Make sure column family `name` exists in `keyspace`.
    ///
    /// The keyspace must already exist.
    pub async fn ensure_column_family(
        &self,
        keyspace: &str,
        name: &str,
        comparator: &str,
    ) -> Result<()> {
        let mut conn = self.pool.borrow(keyspace).await?;
        let client = conn.client_mut();

        if Self::has_column_family(client, keyspace, name).await? {
            debug!(%keyspace, column_family = %name, "Column family exists");
            return Ok(());
        }

        let def = column_family_def(keyspace, name, comparator);
        info!(
            %keyspace,
            column_family = %name,
            caching = def.caching.as_deref().unwrap_or("default"),
            "Creating column family"
        );
        match client.add_column_family(def).await {
            Ok(version) => {
                debug!(%keyspace, column_family = %name, %version, "Column family created");
            }
            Err(ClientError::AlreadyExists(_)) => {
                if !Self::has_column_family(client, keyspace, name).await? {
                    return Err(Error::Permanent(format!(
                        "column family {}.{} reported as existing but is not described",
                        keyspace, name
                    )));
                }
                debug!(%keyspace, column_family = %name, "Column family created concurrently");
            }
            Err(e @ (ClientError::SchemaDisagreement
            | ClientError::Unavailable
            | ClientError::TimedOut
            | ClientError::Transport(_))) => {
                return Err(Error::temporary(
                    &format!("create column family {}.{}", keyspace, name),
                    e,
                ));
            }
            Err(e) => {
                return Err(Error::permanent(
                    &format!("create column family {}.{}", keyspace, name),
                    e,
                ));
            }
        }

        self.wait_for_schema_agreement(client).await
    }

    async fn has_column_family(
        client: &mut dyn ColumnStoreClient,
        keyspace: &str,
        name: &str,
    ) -> Result<bool> {
        let def = client
            .describe_keyspace(keyspace)
            .await
            .map_err(|e| Error::temporary(&format!("describe keyspace {}", keyspace), e))?;
        Ok(def.has_column_family(name))
    }

    /// Poll until every reachable node reports one schema version.
    ///
    /// Gives up with [`Error::SchemaDisagreement`] after the agreement timeout
    /// and with [`Error::Cancelled`] when the manager shuts down.
    pub async fn wait_for_schema_agreement(&self, client: &mut dyn ColumnStoreClient) -> Result<()> {
        let start = Instant::now();
        loop {
            let versions = client
                .describe_schema_versions()
                .await
                .map_err(|e| Error::temporary("describe schema versions", e))?;

            let reachable = versions
                .keys()
                .filter(|v| v.as_str() != UNREACHABLE_VERSION)
                .count();
            if reachable == 1 {
                debug!(waited = ?start.elapsed(), "Schema agreement reached");
                return Ok(());
            }

            let waited = start.elapsed();
            if waited >= self.config.agreement_timeout {
                warn!(?versions, ?waited, "Schema did not converge");
                return Err(Error::SchemaDisagreement { versions, waited });
            }
            debug!(versions = reachable, "Waiting for schema agreement");

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}
