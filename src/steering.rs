//! Background loop that points new connections at the hottest replica.
//!
//! Each tick refreshes the ring, asks the hotspot tracker for the hottest
//! token and, if that token's owner is not the host the connection factory
//! currently targets, swaps the target and closes the pool. Connections
//! checked out at that moment are destroyed when they come back.

use crate::config::SteeringConfig;
use crate::metrics::StoreMetrics;
use crate::partitioning::{HotspotTracker, RingTracker};
use crate::pool::ConnectionPool;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a single steering tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SteeringOutcome {
    /// No writes recorded yet.
    NoData,
    /// The ring has no owner for the hottest token.
    UnknownOwner,
    /// The hottest owner is already the target.
    AlreadyTargeted(String),
    /// The factory now targets a different host.
    Retargeted { from: String, to: String },
}

pub struct Steering {
    pool: ConnectionPool,
    ring: Arc<RingTracker>,
    hotspots: Arc<HotspotTracker>,
    config: SteeringConfig,
    metrics: Arc<StoreMetrics>,
}

impl Steering {
    pub fn new(
        pool: ConnectionPool,
        ring: Arc<RingTracker>,
        hotspots: Arc<HotspotTracker>,
        config: SteeringConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            pool,
            ring,
            hotspots,
            config,
            metrics,
        }
    }

    /// Run one steering pass.
    pub async fn tick(&self) -> SteeringOutcome {
        self.ring.refresh(&self.pool).await;
        let snapshot = self.ring.snapshot();

        let pruned = self.hotspots.retain_ring(&snapshot);
        if pruned > 0 {
            debug!(pruned, "Dropped counters for tokens no longer in the ring");
        }

        let Some(hot) = self.hotspots.hottest() else {
            debug!("No hotspot data yet");
            return SteeringOutcome::NoData;
        };
        self.metrics.hottest_score.set(hot.score);

        let Some(owner) = snapshot.resolve_owner(&hot.token) else {
            debug!(token = %hex::encode(&hot.token), "Hottest token has no owner");
            return SteeringOutcome::UnknownOwner;
        };

        let factory = self.pool.factory();
        let current = factory.target();
        if current.hostname == owner {
            debug!(host = %owner, score = hot.score, "Hottest replica already targeted");
            return SteeringOutcome::AlreadyTargeted(owner.to_string());
        }

        info!(
            from = %current.hostname,
            to = %owner,
            token = %hex::encode(&hot.token),
            score = hot.score,
            "Steering connections to hottest replica"
        );
        factory.retarget(current.with_hostname(owner));
        self.pool.close();
        self.metrics.retargets.inc();

        SteeringOutcome::Retargeted {
            from: current.hostname.clone(),
            to: owner.to_string(),
        }
    }

    /// Start the steering loop. It stops when `cancel` fires; a tick already
    /// running is allowed to finish.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let steering = Arc::clone(self);

        tokio::spawn(async move {
            let period = steering.config.interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?period, "Steering loop started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Steering loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let outcome = steering.tick().await;
                        debug!(?outcome, "Steering tick complete");
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for Steering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Steering")
            .field("interval", &self.config.interval)
            .field("target", &self.pool.factory().target())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, StoreConfig};
    use crate::pool::ConnectionFactory;
    use crate::testing::MemoryCluster;
    use crate::types::Partitioner;
    use bytes::Bytes;
    use std::time::Duration;

    struct Fixture {
        cluster: MemoryCluster,
        pool: ConnectionPool,
        hotspots: Arc<HotspotTracker>,
        steering: Arc<Steering>,
    }

    fn fixture() -> Fixture {
        let cluster = MemoryCluster::new(&["a", "b"]);
        cluster.set_token_map([("40", "a"), ("c0", "b")]);
        let metrics = Arc::new(StoreMetrics::new());
        let pool = ConnectionPool::new(
            Arc::new(ConnectionFactory::new(
                cluster.connector(),
                StoreConfig::default().endpoint_for("a"),
            )),
            PoolConfig::default(),
            metrics.clone(),
        );
        let ring = Arc::new(RingTracker::new(Partitioner::ByteOrdered, metrics.clone()));
        let hotspots = Arc::new(HotspotTracker::new(0.0005));
        let steering = Arc::new(Steering::new(
            pool.clone(),
            ring,
            hotspots.clone(),
            SteeringConfig::default().with_interval(Duration::from_millis(10)),
            metrics,
        ));
        Fixture {
            cluster,
            pool,
            hotspots,
            steering,
        }
    }

    #[tokio::test]
    async fn test_tick_without_data_is_noop() {
        let f = fixture();
        assert_eq!(f.steering.tick().await, SteeringOutcome::NoData);
        assert_eq!(f.pool.factory().generation(), 0);
    }

    #[tokio::test]
    async fn test_tick_retargets_to_hottest_owner() {
        let f = fixture();
        for _ in 0..3 {
            f.hotspots.record_token(Bytes::from_static(&[0xc0]));
        }
        f.hotspots.record_token(Bytes::from_static(&[0x40]));

        assert_eq!(
            f.steering.tick().await,
            SteeringOutcome::Retargeted {
                from: "a".into(),
                to: "b".into()
            }
        );
        assert_eq!(f.pool.factory().target().hostname, "b");
        assert_eq!(f.pool.stats().idle, 0);

        assert_eq!(
            f.steering.tick().await,
            SteeringOutcome::AlreadyTargeted("b".into())
        );
        assert_eq!(f.pool.factory().generation(), 1);
    }

    #[tokio::test]
    async fn test_tick_with_empty_ring_keeps_target() {
        let f = fixture();
        f.cluster.set_token_map(Vec::<(String, String)>::new());
        f.hotspots.record_token(Bytes::from_static(&[0xc0]));
        assert_eq!(f.steering.tick().await, SteeringOutcome::UnknownOwner);
        assert_eq!(f.pool.factory().target().hostname, "a");
    }

    #[tokio::test]
    async fn test_tick_prunes_tokens_outside_ring() {
        let f = fixture();
        // 0x80 is not a ring token; left in place it would steer toward b.
        for _ in 0..5 {
            f.hotspots.record_token(Bytes::from_static(&[0x80]));
        }
        f.hotspots.record_token(Bytes::from_static(&[0x40]));

        assert_eq!(
            f.steering.tick().await,
            SteeringOutcome::AlreadyTargeted("a".into())
        );
        assert_eq!(f.hotspots.len(), 1);
        assert_eq!(f.pool.factory().generation(), 0);
    }

    #[tokio::test]
    async fn test_loop_runs_and_stops_on_cancel() {
        let f = fixture();
        f.hotspots.record_token(Bytes::from_static(&[0xc0]));

        let cancel = CancellationToken::new();
        let handle = f.steering.start(cancel.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.pool.factory().target().hostname != "b" {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
