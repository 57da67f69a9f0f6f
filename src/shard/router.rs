//! Shard worker pool: owns the bounded per-symbol queues and the dedicated
//! tasks that drain them into callback dispatch.
//!
//! Each shard is a `Mutex<VecDeque<_>>` rather than `tokio::mpsc`: the
//! Critical backpressure tier needs to evict the oldest queued item for an
//! essential symbol, which an mpsc channel has no way to express from the
//! producer side. A `Notify` wakes the worker on enqueue so it still blocks
//! on "queue not empty" rather than polling.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Timelike;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{BackpressureTier, TickPool};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::registry::{SubscriptionHandle, SubscriptionRegistry, SubscriptionStatus, TickEvent};
use crate::wire::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
  Sampled,
  Critical,
  Emergency,
  Maximum,
  Shuttingdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
  Accepted,
  Dropped(DropReason),
}

impl EnqueueOutcome {
  /// Only `Maximum` drops are surfaced as an error to the enqueue caller;
  /// every other drop is local policy, logged and absorbed.
  pub fn into_result(self, shard: usize) -> Result<()> {
    match self {
      EnqueueOutcome::Accepted => Ok(()),
      EnqueueOutcome::Dropped(DropReason::Maximum) => Err(EngineError::BufferFull { shard }),
      EnqueueOutcome::Dropped(DropReason::Shuttingdown) => Err(EngineError::Shuttingdown),
      EnqueueOutcome::Dropped(_) => Ok(()),
    }
  }
}

struct QueueItem {
  handle: SubscriptionHandle,
  tick: Box<Tick>,
  enqueued_at: Instant,
}

struct ShardState {
  queue: Mutex<VecDeque<QueueItem>>,
  capacity: usize,
  len: AtomicUsize,
  notify: Notify,
  stopping: AtomicBool,
  sample_counter: AtomicU64,
}

impl ShardState {
  fn new(capacity: usize) -> Self {
    Self {
      queue: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity,
      len: AtomicUsize::new(0),
      notify: Notify::new(),
      stopping: AtomicBool::new(false),
      sample_counter: AtomicU64::new(0),
    }
  }

  fn fill_pct(&self) -> u32 {
    (self.len.load(Ordering::Acquire) as u64 * 100 / self.capacity as u64) as u32
  }

  /// Push if there's room; hands the item back on failure so the caller can
  /// decide on eviction or a drop.
  fn try_push(&self, item: QueueItem) -> std::result::Result<(), QueueItem> {
    let mut q = self.queue.lock().unwrap();
    if q.len() >= self.capacity {
      return Err(item);
    }
    q.push_back(item);
    self.len.fetch_add(1, Ordering::AcqRel);
    Ok(())
  }

  /// Drop the oldest entry and push `item` in its place (Critical tier eviction).
  fn evict_and_push(&self, item: QueueItem) {
    let mut q = self.queue.lock().unwrap();
    q.pop_front();
    q.push_back(item);
  }

  fn pop(&self) -> Option<QueueItem> {
    let mut q = self.queue.lock().unwrap();
    let item = q.pop_front();
    if item.is_some() {
      self.len.fetch_sub(1, Ordering::AcqRel);
    }
    item
  }

  fn is_empty(&self) -> bool {
    self.len.load(Ordering::Acquire) == 0
  }
}

/// Owns the fixed shard pool and the worker tasks draining it.
pub struct ShardRouter {
  shards: Vec<Arc<ShardState>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
  config: Arc<EngineConfig>,
  essential: HashSet<String>,
  pool: Arc<TickPool>,
  pool_miss_snapshot: AtomicU64,
  pressure_elevated_until: Mutex<Option<Instant>>,
}

impl ShardRouter {
  pub fn start(config: Arc<EngineConfig>, registry: Arc<SubscriptionRegistry>) -> Arc<Self> {
    let shards: Vec<_> = (0..config.shards).map(|_| Arc::new(ShardState::new(config.shard_capacity))).collect();
    let essential: HashSet<String> = config.essential_symbols.iter().cloned().collect();
    let pool = Arc::new(TickPool::new(config.tick_pool_capacity));

    let router = Arc::new(Self {
      shards: shards.clone(),
      workers: Mutex::new(Vec::new()),
      config: Arc::clone(&config),
      essential,
      pool: Arc::clone(&pool),
      pool_miss_snapshot: AtomicU64::new(0),
      pressure_elevated_until: Mutex::new(None),
    });

    let mut workers = Vec::new();
    for (index, shard) in shards.into_iter().enumerate() {
      let cfg = Arc::clone(&config);
      let shard_pool = Arc::clone(&pool);
      workers.push(tokio::spawn(run_shard(index, shard, cfg, shard_pool)));
    }
    *router.workers.lock().unwrap() = workers;
    let _ = registry; // resubscription/replay is wired by the engine, not the router itself.
    router
  }

  fn shard_for(&self, symbol: &str) -> usize {
    (super::stable_hash(symbol) % self.shards.len() as u64) as usize
  }

  /// An unexpected run of pool misses since the last check conservatively
  /// elevates the tier used for the grace window: the allocator fallback
  /// path is itself a sign of memory pressure, even if shard fill looks fine.
  fn note_pool_pressure(&self) {
    let misses = self.pool.misses();
    let last = self.pool_miss_snapshot.load(Ordering::Relaxed);
    if misses.saturating_sub(last) >= self.config.pool_miss_threshold {
      self.pool_miss_snapshot.store(misses, Ordering::Relaxed);
      *self.pressure_elevated_until.lock().unwrap() = Some(Instant::now() + self.config.pool_pressure_grace);
      log::warn!("tick pool under pressure ({misses} misses), elevating backpressure tier for {:?}", self.config.pool_pressure_grace);
    }
  }

  fn pressure_elevated(&self) -> bool {
    match *self.pressure_elevated_until.lock().unwrap() {
      Some(until) => Instant::now() < until,
      None => false,
    }
  }

  /// Enqueue one tick for dispatch. Never blocks.
  pub fn queue_tick(&self, handle: SubscriptionHandle, tick: Tick) -> EnqueueOutcome {
    let symbol = handle.symbol();
    let shard_id = self.shard_for(&symbol);
    let shard = &self.shards[shard_id];
    if shard.stopping.load(Ordering::Acquire) {
      return EnqueueOutcome::Dropped(DropReason::Shuttingdown);
    }
    let fill_pct = shard.fill_pct();
    self.note_pool_pressure();
    let mut tier = BackpressureTier::classify(fill_pct, &self.config.backpressure);
    if self.pressure_elevated() {
      tier = tier.elevate();
    }
    let is_essential = tick.is_index || self.essential.contains(&symbol);
    let mut boxed = self.pool.acquire();
    *boxed = tick;
    let item = QueueItem { handle, tick: boxed, enqueued_at: Instant::now() };

    let outcome = match tier {
      BackpressureTier::Normal => match shard.try_push(item) {
        Ok(()) => EnqueueOutcome::Accepted,
        Err(_) => EnqueueOutcome::Dropped(DropReason::Maximum),
      },
      BackpressureTier::Warning => {
        if !is_essential {
          let k = ((100 - fill_pct) / 5).max(2) as u64;
          let n = shard.sample_counter.fetch_add(1, Ordering::Relaxed);
          if n % k == 0 {
            log::warn!("shard {shard_id} sampling drop for {symbol} (fill {fill_pct}%)");
            return EnqueueOutcome::Dropped(DropReason::Sampled);
          }
        }
        match shard.try_push(item) {
          Ok(()) => EnqueueOutcome::Accepted,
          Err(_) => EnqueueOutcome::Dropped(DropReason::Maximum),
        }
      }
      BackpressureTier::Critical => {
        if !is_essential {
          log::warn!("shard {shard_id} critical-tier drop for non-essential {symbol}");
          return EnqueueOutcome::Dropped(DropReason::Critical);
        }
        match shard.try_push(item) {
          Ok(()) => EnqueueOutcome::Accepted,
          Err(item) => {
            log::warn!("shard {shard_id} evicting oldest entry for essential {symbol}");
            shard.evict_and_push(item);
            EnqueueOutcome::Accepted
          }
        }
      }
      BackpressureTier::Emergency => {
        if !is_essential {
          log::warn!("shard {shard_id} emergency-tier reject for {symbol}");
          return EnqueueOutcome::Dropped(DropReason::Emergency);
        }
        match shard.try_push(item) {
          Ok(()) => EnqueueOutcome::Accepted,
          Err(_) => EnqueueOutcome::Dropped(DropReason::Maximum),
        }
      }
      BackpressureTier::Maximum => {
        log::warn!("shard {shard_id} at maximum capacity, rejecting {symbol}");
        EnqueueOutcome::Dropped(DropReason::Maximum)
      }
    };

    if outcome == EnqueueOutcome::Accepted {
      shard.notify.notify_one();
    }
    outcome
  }

  /// Signal all workers to drain and stop, then wait for them to finish.
  /// Every tick enqueued before the stop signal is still delivered.
  pub async fn shutdown(&self) {
    for shard in &self.shards {
      shard.stopping.store(true, Ordering::Release);
      shard.notify.notify_waiters();
    }
    let handles = std::mem::take(&mut *self.workers.lock().unwrap());
    for handle in handles {
      let _ = handle.await;
    }
  }
}

async fn run_shard(index: usize, shard: Arc<ShardState>, config: Arc<EngineConfig>, pool: Arc<TickPool>) {
  loop {
    match shard.pop() {
      Some(item) => dispatch_one(index, item, &config, &pool).await,
      None => {
        if shard.stopping.load(Ordering::Acquire) && shard.is_empty() {
          break;
        }
        shard.notify.notified().await;
      }
    }
  }
}

fn within_market_hours(config: &EngineConfig, symbol: &str) -> bool {
  if config.extended_hours_prefixes.iter().any(|p| symbol.starts_with(p.as_str())) {
    return true;
  }
  let now = chrono::Local::now();
  let (open_h, open_m) = config.market_window.open;
  let (close_h, close_m) = config.market_window.close;
  let minutes = now.hour() * 60 + now.minute();
  let open = open_h as u32 * 60 + open_m as u32;
  let close = close_h as u32 * 60 + close_m as u32;
  minutes >= open && minutes <= close
}

fn round_to_tick(price: f64, tick_size: f64) -> f64 {
  ((price / tick_size).round() * tick_size).max(0.0)
}

async fn dispatch_one(shard_index: usize, item: QueueItem, config: &EngineConfig, pool: &TickPool) {
  let QueueItem { handle, tick, enqueued_at } = item;

  // First tick for a Pending subscription both seeds it and is delivered:
  // deferring the transition until after delivery would silently drop the
  // first price a caller ever sees.
  if handle.status() == SubscriptionStatus::Pending {
    handle.mark_live();
  }

  let symbol = handle.symbol();
  let market_open = within_market_hours(config, &symbol);
  let price = tick.last_price.map(|p| round_to_tick(p, config.tick_size));
  let timestamp = tick.exchange_timestamp.or(tick.last_traded_timestamp).map(|d| d.as_secs() as i64);
  let mode = tick.mode;
  let volume = tick.volume_traded;
  let token = tick.instrument_token;

  handle.observe(price, volume, timestamp, market_open);
  pool.release(tick);

  if !market_open {
    log::trace!("shard {shard_index} suppressing dispatch for {symbol} outside market hours");
    return;
  }

  let Some(price) = price else { return };

  let callbacks = handle.snapshot_callbacks();
  if callbacks.is_empty() {
    return;
  }

  let event = TickEvent { mode, price, volume, timestamp, token };

  for (id, _mode, callback) in callbacks.iter() {
    let started = Instant::now();
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event))).is_err() {
      log::error!("callback {id} on {symbol} panicked; continuing with remaining callbacks");
    }
    let elapsed = started.elapsed();
    if elapsed > config.slow_callback {
      log::warn!("SlowCallback: id={id} symbol={symbol} elapsed={elapsed:?}");
    }
  }

  log::trace!("shard {shard_index} dispatched {symbol} after {:?} queue wait", enqueued_at.elapsed());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{BackpressureThresholds, EngineConfig};
  use crate::registry::SubscriptionRegistry;
  use crate::wire::{Mode, Segment};
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  fn tick_for(token: u32, is_index: bool) -> Tick {
    Tick {
      mode: Mode::LTP,
      instrument_token: token,
      segment: Segment::NSE,
      is_index,
      last_price: Some(100.0),
      ..Tick::default()
    }
  }

  fn make_router(cfg: EngineConfig) -> (Arc<ShardRouter>, Arc<SubscriptionRegistry>) {
    let registry = Arc::new(SubscriptionRegistry::new());
    let router = ShardRouter::start(Arc::new(cfg), Arc::clone(&registry));
    (router, registry)
  }

  #[tokio::test]
  async fn same_symbol_always_routes_to_same_shard() {
    let cfg = EngineConfig::default();
    let (router, _registry) = make_router(cfg);
    assert_eq!(router.shard_for("RELIANCE"), router.shard_for("RELIANCE"));
    router.shutdown().await;
  }

  // Once a shard is fully saturated, further enqueues of the same
  // non-essential symbol are rejected at the Maximum tier.
  #[tokio::test]
  async fn backpressure_rejects_once_shard_is_completely_full() {
    let cfg = EngineConfig::builder()
      .shards(1)
      .shard_capacity(4)
      .backpressure(BackpressureThresholds { warning_pct: 50, critical_pct: 70, emergency_pct: 75 })
      .build()
      .unwrap();
    let (router, registry) = make_router(cfg);
    registry.bind_token("Z", 1).unwrap();
    let handle = registry.lookup_by_token(1).unwrap();

    // The test never awaits before the loop, so on the current-thread runtime
    // the freshly spawned worker has no chance to drain anything in between:
    // fill accumulates deterministically.
    let mut last = EnqueueOutcome::Accepted;
    for _ in 0..6 {
      last = router.queue_tick(Arc::clone(&handle), tick_for(1, false));
    }
    assert_eq!(last, EnqueueOutcome::Dropped(DropReason::Maximum));
    router.shutdown().await;
  }

  #[tokio::test]
  async fn essential_index_symbol_survives_emergency_tier() {
    let cfg = EngineConfig::builder()
      .shards(1)
      .shard_capacity(4)
      .backpressure(BackpressureThresholds { warning_pct: 10, critical_pct: 20, emergency_pct: 30 })
      .build()
      .unwrap();
    let (router, registry) = make_router(cfg);
    registry.bind_token("NIFTY 50", 256265).unwrap();
    let handle = registry.lookup_by_token(256265).unwrap();

    let outcome = router.queue_tick(Arc::clone(&handle), tick_for(256265, true));
    assert_eq!(outcome, EnqueueOutcome::Accepted);
    router.shutdown().await;
  }

  // A run of pool misses elevates the tier for a grace window even though
  // the shard itself is nearly empty.
  #[tokio::test]
  async fn sustained_pool_misses_elevate_the_backpressure_tier() {
    let cfg = EngineConfig::builder()
      .shards(1)
      .shard_capacity(1000)
      .tick_pool_capacity(2)
      .pool_miss_threshold(3)
      .pool_pressure_grace(Duration::from_secs(5))
      .build()
      .unwrap();
    let (router, registry) = make_router(cfg);
    registry.bind_token("Z", 1).unwrap();
    let handle = registry.lookup_by_token(1).unwrap();

    // No await before this loop, so on the current-thread test runtime the
    // worker never runs in between and nothing is released back to the pool.
    assert!(!router.pressure_elevated());
    for _ in 0..5 {
      router.queue_tick(Arc::clone(&handle), tick_for(1, false));
    }
    assert!(router.pool.misses() >= 3);
    assert!(router.pressure_elevated());
    router.shutdown().await;
  }

  // Shutdown drains everything enqueued before the stop signal.
  #[tokio::test]
  async fn shutdown_drains_all_enqueued_ticks_exactly_once() {
    let cfg = EngineConfig::builder()
      .shards(1)
      .shard_capacity(64)
      .extended_hours_prefixes(["X".to_string()])
      .build()
      .unwrap();
    let registry = Arc::new(SubscriptionRegistry::new());
    let seen = Arc::new(AtomicU32::new(0));
    let seen2 = Arc::clone(&seen);
    registry
      .add_callback("X", 1, Mode::LTP, Arc::new(move |_ev| {
        seen2.fetch_add(1, Ordering::SeqCst);
      }))
      .unwrap();
    registry.bind_token("X", 5).unwrap();
    let handle = registry.lookup_by_token(5).unwrap();

    let router = ShardRouter::start(Arc::new(cfg), Arc::clone(&registry));
    for _ in 0..10 {
      router.queue_tick(Arc::clone(&handle), tick_for(5, false));
    }
    router.shutdown().await;
    assert_eq!(seen.load(Ordering::SeqCst), 10);
  }

  // A tick enqueued in steady state (no shutdown involved) must reach its
  // callback without anything else ever calling `notify_waiters`, proving
  // `queue_tick` wakes the parked worker itself.
  #[tokio::test]
  async fn queued_tick_is_dispatched_without_a_shutdown_call() {
    let cfg = EngineConfig::builder()
      .shards(1)
      .shard_capacity(64)
      .extended_hours_prefixes(["X".to_string()])
      .build()
      .unwrap();
    let registry = Arc::new(SubscriptionRegistry::new());
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Mutex::new(Some(tx));
    registry
      .add_callback("X", 1, Mode::LTP, Arc::new(move |_ev| {
        if let Some(tx) = tx.lock().unwrap().take() {
          let _ = tx.send(());
        }
      }))
      .unwrap();
    registry.bind_token("X", 5).unwrap();
    let handle = registry.lookup_by_symbol("X").unwrap();

    let router = ShardRouter::start(Arc::new(cfg), Arc::clone(&registry));
    router.queue_tick(handle, tick_for(5, false));

    tokio::time::timeout(Duration::from_secs(1), rx)
      .await
      .expect("callback should fire promptly once queue_tick wakes the worker")
      .unwrap();

    router.shutdown().await;
  }

  // Once a shard has been told to stop, further enqueues are rejected
  // rather than silently accepted into a queue nothing will ever drain.
  #[tokio::test]
  async fn enqueue_after_shutdown_is_rejected() {
    let cfg = EngineConfig::builder().shards(1).shard_capacity(64).build().unwrap();
    let (router, registry) = make_router(cfg);
    registry.bind_token("Z", 1).unwrap();
    let handle = registry.lookup_by_token(1).unwrap();

    router.shutdown().await;

    let outcome = router.queue_tick(Arc::clone(&handle), tick_for(1, false));
    assert_eq!(outcome, EnqueueOutcome::Dropped(DropReason::Shuttingdown));
  }
}
