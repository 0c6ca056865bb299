//! Decaying write-frequency counters per range-end token.

use super::RingSnapshot;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug)]
struct CounterState {
    score: f64,
    last_update: Instant,
}

/// A score that decays as `score * exp(-decay * elapsed_ms)`.
#[derive(Debug)]
pub struct HotnessCounter {
    decay_per_ms: f64,
    state: Mutex<CounterState>,
}

impl HotnessCounter {
    pub fn new(decay_per_ms: f64) -> Self {
        Self::starting_at(decay_per_ms, Instant::now())
    }

    pub fn starting_at(decay_per_ms: f64, now: Instant) -> Self {
        Self {
            decay_per_ms,
            state: Mutex::new(CounterState {
                score: 0.0,
                last_update: now,
            }),
        }
    }

    fn decayed(&self, state: &CounterState, now: Instant) -> f64 {
        let elapsed_ms = now.saturating_duration_since(state.last_update).as_secs_f64() * 1000.0;
        state.score * (-self.decay_per_ms * elapsed_ms).exp()
    }

    /// Record one event.
    pub fn update(&self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.score = self.decayed(&state, now) + 1.0;
        state.last_update = now;
    }

    /// Decayed score as of now.
    pub fn current(&self) -> f64 {
        self.current_at(Instant::now())
    }

    pub fn current_at(&self, now: Instant) -> f64 {
        let state = self.state.lock();
        self.decayed(&state, now)
    }
}

/// The hottest token at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Hotspot {
    pub token: Bytes,
    pub score: f64,
}

/// Tracks write pressure per partition-owning token.
#[derive(Debug)]
pub struct HotspotTracker {
    decay_per_ms: f64,
    counters: DashMap<Bytes, HotnessCounter>,
}

impl HotspotTracker {
    pub fn new(decay_per_ms: f64) -> Self {
        Self {
            decay_per_ms,
            counters: DashMap::new(),
        }
    }

    /// Charge a write of `key` to the token that owns it.
    ///
    /// No-op when the ring is still empty.
    pub fn record_write(&self, ring: &RingSnapshot, key: &[u8]) {
        match ring.resolve_token(key) {
            Some(token) => {
                self.record_token(token.clone());
                trace!(token = %hex::encode(token), key = %hex::encode(key), "Updated hotness counter");
            }
            None => {
                debug!(key = %hex::encode(key), "No token found for key, skipping counter update");
            }
        }
    }

    pub fn record_token(&self, token: Bytes) {
        self.record_token_at(token, Instant::now());
    }

    pub fn record_token_at(&self, token: Bytes, now: Instant) {
        self.counters
            .entry(token)
            .or_insert_with(|| HotnessCounter::starting_at(self.decay_per_ms, now))
            .update_at(now);
    }

    /// The token with the highest decayed score, if any counter exists.
    pub fn hottest(&self) -> Option<Hotspot> {
        self.hottest_at(Instant::now())
    }

    pub fn hottest_at(&self, now: Instant) -> Option<Hotspot> {
        let mut best: Option<Hotspot> = None;
        for entry in self.counters.iter() {
            let score = entry.value().current_at(now);
            if best.as_ref().map_or(true, |b| b.score < score) {
                best = Some(Hotspot {
                    token: entry.key().clone(),
                    score,
                });
            }
        }
        best
    }

    /// Drop counters for tokens that are no longer in `ring`, returning how
    /// many were removed. An empty ring prunes nothing.
    pub fn retain_ring(&self, ring: &RingSnapshot) -> usize {
        if ring.is_empty() {
            return 0;
        }
        let before = self.counters.len();
        self.counters
            .retain(|token, _| ring.owner_of_token(token).is_some());
        before.saturating_sub(self.counters.len())
    }

    /// Number of tokens with a counter.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn clear(&self) {
        self.counters.clear();
    }
}
