//! Token ring tracking and write hotspot detection.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      RingTracker                         │
//! │   T1 ──> host A   T2 ──> host B   T3 ──> host C          │
//! │   key <= T1 -> A,  (T1,T2] -> B,  (T2,T3] -> C,  > T3 -> A│
//! └──────────────────────────────────────────────────────────┘
//!                │ resolve_token(key)
//!                ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                    HotspotTracker                        │
//! │   T1: 0.8     T2: 12.4     T3: 3.1   (decaying scores)   │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod hotspot;
mod ring;

pub use hotspot::{HotnessCounter, Hotspot, HotspotTracker};
pub use ring::{RingSnapshot, RingTracker};
