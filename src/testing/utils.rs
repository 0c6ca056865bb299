use crate::config::{SchemaConfig, SteeringConfig, StoreConfig};
use crate::store::StoreManager;
use crate::testing::MemoryCluster;
use crate::types::{Entry, KeyMutation, StoreMutations};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Config targeting the first host of `cluster`, with fast schema polls and
/// steering ticks.
pub(crate) fn store_config(cluster: &MemoryCluster, steering: bool) -> StoreConfig {
    StoreConfig::new(vec![cluster.hosts()[0].clone()])
        .with_schema_config(SchemaConfig::new(
            Duration::from_secs(5),
            Duration::from_millis(5),
        ))
        .with_steering_config(SteeringConfig {
            enabled: steering,
            ..SteeringConfig::default().with_interval(Duration::from_millis(20))
        })
}

/// Connect a manager to `cluster`.
pub(crate) async fn connect(cluster: &MemoryCluster, steering: bool) -> StoreManager {
    StoreManager::connect(store_config(cluster, steering), cluster.connector())
        .await
        .unwrap()
}

/// Mutations for a single store and key.
pub(crate) fn single_key(
    store: &str,
    key: &[u8],
    additions: Vec<Entry>,
    deletions: Vec<Bytes>,
) -> StoreMutations {
    let mut by_key = BTreeMap::new();
    by_key.insert(Bytes::copy_from_slice(key), KeyMutation::new(additions, deletions));
    let mut mutations = StoreMutations::new();
    mutations.insert(store.to_string(), by_key);
    mutations
}

/// Poll `predicate` until it holds or `timeout` passes.
pub(crate) async fn wait_for<P>(predicate: P, timeout: Duration) -> bool
where
    P: Fn() -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(10);

    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    predicate()
}
