//! Tick object pool: reduces allocator churn under sustained load by
//! reusing boxed `Tick` slots instead of allocating one per decoded packet.
//!
//! Multi-producer/multi-consumer by construction (`crossbeam_queue::ArrayQueue`
//! is lock-free); on exhaustion `acquire` falls back to a fresh allocation
//! rather than blocking, matching the "bounded, falls back to allocation"
//! policy.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::wire::Tick;

pub struct TickPool {
  slots: ArrayQueue<Box<Tick>>,
  misses: AtomicU64,
}

impl TickPool {
  pub fn new(capacity: usize) -> Self {
    Self {
      slots: ArrayQueue::new(capacity),
      misses: AtomicU64::new(0),
    }
  }

  /// Take a pooled slot, or allocate fresh on exhaustion.
  pub fn acquire(&self) -> Box<Tick> {
    self.slots.pop().unwrap_or_else(|| {
      self.misses.fetch_add(1, Ordering::Relaxed);
      Box::new(Tick::default())
    })
  }

  /// Return a slot to the pool. Dropped silently if the pool is at capacity.
  pub fn release(&self, mut tick: Box<Tick>) {
    *tick = Tick::default();
    let _ = self.slots.push(tick);
  }

  /// Allocations that bypassed the pool because it was empty; a sustained
  /// climb here is the signal to grow `shard_capacity` or pool size.
  pub fn misses(&self) -> u64 {
    self.misses.load(Ordering::Relaxed)
  }
}
