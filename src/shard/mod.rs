//! Sharded Tick Processor: bounded per-symbol queues, multi-tier
//! backpressure, and dedicated worker tasks that fan out to callbacks.
//!
//! Dispatch is decoupled from the socket-read task onto one `tokio` task per
//! shard, so a slow callback on one symbol can never stall another symbol's
//! delivery.

mod pool;
mod router;

pub use pool::TickPool;
pub use router::{DropReason, EnqueueOutcome, ShardRouter};

/// FNV-1a, used only for deterministic shard placement — not cryptographic.
pub fn stable_hash(key: &str) -> u64 {
  const OFFSET: u64 = 0xcbf29ce484222325;
  const PRIME: u64 = 0x100000001b3;
  key.bytes().fold(OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureTier {
  Normal,
  Warning,
  Critical,
  Emergency,
  Maximum,
}

impl BackpressureTier {
  /// Classify a shard's fill ratio (percent, 0-100+) against the configured thresholds.
  pub fn classify(fill_pct: u32, thresholds: &crate::config::BackpressureThresholds) -> Self {
    if fill_pct >= 100 {
      BackpressureTier::Maximum
    } else if fill_pct >= thresholds.emergency_pct as u32 {
      BackpressureTier::Emergency
    } else if fill_pct >= thresholds.critical_pct as u32 {
      BackpressureTier::Critical
    } else if fill_pct >= thresholds.warning_pct as u32 {
      BackpressureTier::Warning
    } else {
      BackpressureTier::Normal
    }
  }

  /// One notch more conservative, capped at `Maximum`. Used when the tick
  /// pool reports sustained allocator pressure (§4.D memory-pressure
  /// coupling): the processor treats that as if the shard were fuller than
  /// it measures.
  pub fn elevate(self) -> Self {
    match self {
      BackpressureTier::Normal => BackpressureTier::Warning,
      BackpressureTier::Warning => BackpressureTier::Critical,
      BackpressureTier::Critical => BackpressureTier::Emergency,
      BackpressureTier::Emergency | BackpressureTier::Maximum => BackpressureTier::Maximum,
    }
  }
}
