//! Metrics for monitoring the adapter.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        StoreMetrics                          │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │  Mutations   │  │   Connections    │  │   Steering     │  │
//! │  │ - batches    │  │ - created        │  │ - refreshes    │  │
//! │  │ - failures   │  │ - destroyed      │  │ - retargets    │  │
//! │  │ - columns    │  │ - recycled       │  │ - hottest      │  │
//! │  └──────────────┘  └──────────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::{FloatGauge, Gauge};

/// Metrics shared by the pool, the mutation path and the steering loop.
#[derive(Debug)]
pub struct StoreMetrics {
    // Mutation path
    pub mutation_batches: Counter,
    pub mutation_failures: Counter,
    pub columns_written: LabeledCounter<1>,

    // Connection pool
    pub connections_created: Counter,
    pub connections_destroyed: Counter,
    pub connections_recycled: Counter,
    pub borrows: Counter,
    pub borrow_failures: Counter,

    // Ring and steering
    pub ring_refreshes: Counter,
    pub ring_refresh_failures: Counter,
    pub retargets: Counter,
    pub hottest_score: FloatGauge,

    // Stores
    pub open_stores: Gauge,
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            mutation_batches: Counter::new("mutation_batches_total", "Mutation batches sent"),
            mutation_failures: Counter::new("mutation_failures_total", "Failed mutation batches"),
            columns_written: LabeledCounter::new(
                "columns_written_total",
                "Column operations sent per store",
                ["store"],
            ),

            connections_created: Counter::new("connections_created_total", "Connections opened"),
            connections_destroyed: Counter::new(
                "connections_destroyed_total",
                "Connections torn down",
            ),
            connections_recycled: Counter::new(
                "connections_recycled_total",
                "Connections returned to the idle set",
            ),
            borrows: Counter::new("pool_borrows_total", "Successful borrows"),
            borrow_failures: Counter::new("pool_borrow_failures_total", "Failed borrows"),

            ring_refreshes: Counter::new("ring_refreshes_total", "Successful ring refreshes"),
            ring_refresh_failures: Counter::new(
                "ring_refresh_failures_total",
                "Failed ring refreshes",
            ),
            retargets: Counter::new("endpoint_retargets_total", "Endpoint target swaps"),
            hottest_score: FloatGauge::new("hottest_token_score", "Decayed score of the hottest token"),

            open_stores: Gauge::new("open_stores", "Open store handles"),
        }
    }

    /// Point-in-time copy of all values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            mutation_batches: self.mutation_batches.get(),
            mutation_failures: self.mutation_failures.get(),
            connections_created: self.connections_created.get(),
            connections_destroyed: self.connections_destroyed.get(),
            connections_recycled: self.connections_recycled.get(),
            borrows: self.borrows.get(),
            borrow_failures: self.borrow_failures.get(),
            ring_refreshes: self.ring_refreshes.get(),
            ring_refresh_failures: self.ring_refresh_failures.get(),
            retargets: self.retargets.get(),
            hottest_score: self.hottest_score.get(),
            open_stores: self.open_stores.get(),
        }
    }
}

/// Snapshot of [`StoreMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub mutation_batches: u64,
    pub mutation_failures: u64,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub connections_recycled: u64,
    pub borrows: u64,
    pub borrow_failures: u64,
    pub ring_refreshes: u64,
    pub ring_refresh_failures: u64,
    pub retargets: u64,
    pub hottest_score: f64,
    pub open_stores: i64,
}

impl MetricsSnapshot {
    /// Fraction of mutation batches that failed.
    pub fn mutation_failure_rate(&self) -> f64 {
        if self.mutation_batches == 0 {
            0.0
        } else {
            self.mutation_failures as f64 / self.mutation_batches as f64
        }
    }
}
