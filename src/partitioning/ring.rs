//! Token ring snapshots and the tracker that refreshes them.
//!
//! A snapshot maps range-end tokens to the endpoint owning
//! `(previous token, token]`. The first token also owns everything past the
//! last token. Snapshots are immutable; the tracker swaps in a fully built
//! replacement so readers see either the old ring or the new one.

use crate::error::{Error, Result};
use crate::metrics::StoreMetrics;
use crate::pool::ConnectionPool;
use crate::types::{Partitioner, SYSTEM_KEYSPACE};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Immutable token -> endpoint mapping, iterated in ascending token order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingSnapshot {
    owners: BTreeMap<Bytes, String>,
}

impl RingSnapshot {
    pub fn new(owners: BTreeMap<Bytes, String>) -> Self {
        Self { owners }
    }

    /// Build a snapshot from a token map as reported by the cluster.
    ///
    /// Tokens are decoded with the partitioner's token encoding and kept
    /// sorted, so ring order never depends on the order the map arrived in.
    pub fn from_token_map(
        token_map: &BTreeMap<String, String>,
        partitioner: Partitioner,
    ) -> Result<Self> {
        let mut owners = BTreeMap::new();
        for (token, endpoint) in token_map {
            let decoded = partitioner.decode_token(token).ok_or_else(|| {
                Error::Permanent(format!(
                    "token {:?} cannot be decoded for {:?}",
                    token, partitioner
                ))
            })?;
            owners.insert(decoded, endpoint.clone());
        }
        Ok(Self { owners })
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Tokens with their owners in ring order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &str)> {
        self.owners.iter().map(|(t, e)| (t, e.as_str()))
    }

    /// Endpoint registered for exactly this token.
    pub fn owner_of_token(&self, token: &[u8]) -> Option<&str> {
        self.owners.get(token).map(String::as_str)
    }

    /// The range-end token responsible for `key`, or `None` on an empty ring.
    pub fn resolve_token(&self, key: &[u8]) -> Option<&Bytes> {
        let (token, _) = self.resolve(key)?;
        Some(token)
    }

    /// The endpoint responsible for `key`, or `None` on an empty ring.
    pub fn resolve_owner(&self, key: &[u8]) -> Option<&str> {
        let (_, owner) = self.resolve(key)?;
        Some(owner)
    }

    fn resolve(&self, key: &[u8]) -> Option<(&Bytes, &str)> {
        if let Some((token, owner)) = self
            .owners
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
        {
            trace!(key = %hex::encode(key), token = %hex::encode(token), "Key falls in token range");
            return Some((token, owner.as_str()));
        }

        // Past the last token: wraps to the first.
        let (token, owner) = self.owners.iter().next()?;
        trace!(key = %hex::encode(key), token = %hex::encode(token), "Key wraps to first token");
        Some((token, owner.as_str()))
    }
}

/// Keeps the latest ring snapshot for the cluster.
pub struct RingTracker {
    partitioner: Partitioner,
    snapshot: RwLock<Arc<RingSnapshot>>,
    metrics: Arc<StoreMetrics>,
}

impl RingTracker {
    pub fn new(partitioner: Partitioner, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            partitioner,
            snapshot: RwLock::new(Arc::new(RingSnapshot::default())),
            metrics,
        }
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.snapshot.read().clone()
    }

    /// Install a snapshot.
    pub fn publish(&self, snapshot: RingSnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Query the cluster for its token map and publish a new snapshot.
    ///
    /// Failures are logged and the previous snapshot stays in place.
    /// Returns whether a new snapshot was published.
    pub async fn refresh(&self, pool: &ConnectionPool) -> bool {
        match self.fetch(pool).await {
            Ok(snapshot) => {
                debug!(tokens = snapshot.len(), "Updated token map");
                for (token, endpoint) in snapshot.iter() {
                    trace!(token = %hex::encode(token), %endpoint, "Token map entry");
                }
                self.publish(snapshot);
                self.metrics.ring_refreshes.inc();
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to refresh token map, keeping previous ring");
                self.metrics.ring_refresh_failures.inc();
                false
            }
        }
    }

    async fn fetch(&self, pool: &ConnectionPool) -> Result<RingSnapshot> {
        let mut conn = pool.borrow(SYSTEM_KEYSPACE).await?;
        let token_map = conn
            .client_mut()
            .describe_token_map()
            .await
            .map_err(|e| Error::temporary("describe_token_map", e))?;
        RingSnapshot::from_token_map(&token_map, self.partitioner)
    }

    /// Range-end token responsible for `key` in the current snapshot.
    pub fn key_end_token(&self, key: &[u8]) -> Option<Bytes> {
        self.snapshot().resolve_token(key).cloned()
    }

    /// Endpoint responsible for `key` in the current snapshot.
    pub fn key_hostname(&self, key: &[u8]) -> Option<String> {
        self.snapshot().resolve_owner(key).map(str::to_string)
    }
}

impl std::fmt::Debug for RingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingTracker")
            .field("partitioner", &self.partitioner)
            .field("tokens", &self.snapshot.read().len())
            .finish()
    }
}
