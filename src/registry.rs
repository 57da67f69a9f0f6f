//! Subscription Registry: the authoritative token↔symbol map and
//! per-symbol callback fan-out set.
//!
//! The outer maps are [`dashmap::DashMap`]s (sharded internally, so
//! unrelated keys never contend), and each subscription's callback list is
//! stored as an `Arc<Vec<_>>` swapped under a short write lock — readers
//! (the hot tick-dispatch path) just clone the `Arc` rather than copying
//! the list itself.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{EngineError, Result};
use crate::wire::Mode;

pub type CallbackId = u64;

/// `(market_data_type, price, volume, timestamp_secs, token)` delivered to
/// every callback registered on the tick's subscription.
#[derive(Debug, Clone, Copy)]
pub struct TickEvent {
  pub mode: Mode,
  pub price: f64,
  pub volume: Option<u32>,
  pub timestamp: Option<i64>,
  pub token: u32,
}

pub type Callback = Arc<dyn Fn(TickEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
  Pending,
  Live,
}

impl From<u8> for SubscriptionStatus {
  fn from(v: u8) -> Self {
    if v == 1 {
      SubscriptionStatus::Live
    } else {
      SubscriptionStatus::Pending
    }
  }
}

struct CallbackEntry {
  id: CallbackId,
  mode: Mode,
  callback: Callback,
}

/// Shared subscription state for one instrument. Reached either by token
/// (once bound) or by any of its registered symbol aliases.
pub struct SubscriptionInner {
  primary_symbol: RwLock<String>,
  aliases: RwLock<Vec<String>>,
  token: RwLock<Option<u32>>,
  status: AtomicU8,
  ref_count: AtomicI64,
  is_index: std::sync::atomic::AtomicBool,
  callbacks: RwLock<Arc<Vec<CallbackEntry>>>,
  last_seen: Mutex<(Option<f64>, Option<u32>)>,
  last_seen_at: RwLock<Option<i64>>,
}

pub type SubscriptionHandle = Arc<SubscriptionInner>;

impl SubscriptionInner {
  fn new(symbol: &str) -> Self {
    Self {
      primary_symbol: RwLock::new(symbol.to_string()),
      aliases: RwLock::new(Vec::new()),
      token: RwLock::new(None),
      status: AtomicU8::new(0),
      ref_count: AtomicI64::new(0),
      is_index: std::sync::atomic::AtomicBool::new(false),
      callbacks: RwLock::new(Arc::new(Vec::new())),
      last_seen: Mutex::new((None, None)),
      last_seen_at: RwLock::new(None),
    }
  }

  pub fn symbol(&self) -> String {
    self.primary_symbol.read().unwrap().clone()
  }

  pub fn token(&self) -> Option<u32> {
    *self.token.read().unwrap()
  }

  pub fn status(&self) -> SubscriptionStatus {
    self.status.load(Ordering::Acquire).into()
  }

  pub fn ref_count(&self) -> i64 {
    self.ref_count.load(Ordering::Acquire)
  }

  pub fn is_index(&self) -> bool {
    self.is_index.load(Ordering::Relaxed)
  }

  pub fn set_index(&self, index: bool) {
    self.is_index.store(index, Ordering::Relaxed);
  }

  /// Effective mode: the maximum across all currently registered callbacks.
  pub fn effective_mode(&self) -> Option<Mode> {
    self.callbacks.read().unwrap().iter().map(|c| c.mode).max()
  }

  /// Cheap snapshot of the current callback list for dispatch.
  pub fn snapshot_callbacks(&self) -> Arc<Vec<(CallbackId, Mode, Callback)>> {
    let entries = self.callbacks.read().unwrap();
    Arc::new(
      entries
        .iter()
        .map(|e| (e.id, e.mode, Arc::clone(&e.callback)))
        .collect(),
    )
  }

  pub fn last_seen(&self) -> (Option<f64>, Option<u32>) {
    *self.last_seen.lock().unwrap()
  }

  pub fn last_seen_at(&self) -> Option<i64> {
    *self.last_seen_at.read().unwrap()
  }

  /// Record a tick's state per the market-hours seeding policy: the
  /// first price for a symbol is always accepted (seeds the UI), but the
  /// timestamp and subsequent price/volume updates only land while
  /// `market_open` is true.
  pub fn observe(&self, price: Option<f64>, volume: Option<u32>, timestamp: Option<i64>, market_open: bool) {
    let mut seen = self.last_seen.lock().unwrap();
    let is_first = seen.0.is_none();
    if is_first || market_open {
      if price.is_some() {
        seen.0 = price;
      }
      if volume.is_some() {
        seen.1 = volume;
      }
    }
    drop(seen);
    if market_open {
      if let Some(ts) = timestamp {
        *self.last_seen_at.write().unwrap() = Some(ts);
      }
    }
  }

  /// Transition Pending → Live; a no-op once already Live.
  pub fn mark_live(&self) {
    self.status.store(1, Ordering::Release);
  }

  fn add_callback(&self, id: CallbackId, mode: Mode, callback: Callback) {
    let mut guard = self.callbacks.write().unwrap();
    let mut next: Vec<CallbackEntry> = guard.iter().filter(|e| e.id != id).map(|e| CallbackEntry {
      id: e.id,
      mode: e.mode,
      callback: Arc::clone(&e.callback),
    }).collect();
    next.push(CallbackEntry { id, mode, callback });
    *guard = Arc::new(next);
  }

  /// Returns true if an entry with `id` was present and removed.
  fn remove_callback(&self, id: CallbackId) -> bool {
    let mut guard = self.callbacks.write().unwrap();
    let before = guard.len();
    let next: Vec<CallbackEntry> = guard
      .iter()
      .filter(|e| e.id != id)
      .map(|e| CallbackEntry {
        id: e.id,
        mode: e.mode,
        callback: Arc::clone(&e.callback),
      })
      .collect();
    let removed = next.len() != before;
    *guard = Arc::new(next);
    removed
  }

  fn callback_count(&self) -> usize {
    self.callbacks.read().unwrap().len()
  }
}

impl std::fmt::Debug for SubscriptionInner {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SubscriptionInner")
      .field("symbol", &self.symbol())
      .field("token", &self.token())
      .field("status", &self.status())
      .field("ref_count", &self.ref_count())
      .field("callbacks", &self.callback_count())
      .finish()
  }
}

/// Authoritative map of token↔symbol and symbol→callback set.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
  by_symbol: DashMap<String, SubscriptionHandle>,
  by_token: DashMap<u32, SubscriptionHandle>,
}

impl SubscriptionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `callback` under `id` on `symbol`'s subscription, creating it
  /// in `Pending` state if it doesn't exist yet. Adding a
  /// new id never replaces another id's callback on the same symbol.
  pub fn add_callback(
    &self,
    symbol: &str,
    id: CallbackId,
    mode: Mode,
    callback: Callback,
  ) -> Result<()> {
    let handle = self
      .by_symbol
      .entry(symbol.to_string())
      .or_insert_with(|| Arc::new(SubscriptionInner::new(symbol)))
      .clone();
    handle.add_callback(id, mode, callback);
    handle.ref_count.fetch_add(1, Ordering::AcqRel);
    Ok(())
  }

  /// Remove `id`'s callback from `symbol`. Returns whether it was present.
  /// Decrements the sticky ref count; at zero, the subscription is torn
  /// down.
  pub fn remove_callback(&self, symbol: &str, id: CallbackId) -> bool {
    let Some(handle) = self.by_symbol.get(symbol).map(|e| e.clone()) else {
      return false;
    };
    let removed = handle.remove_callback(id);
    if removed {
      self.release_ref(&handle);
    }
    removed
  }

  /// Pin a subscription alive independent of callback churn (sticky lifetime,
  /// e.g. kept warm across a reconnect even with no active callback).
  pub fn ref_incr(&self, symbol: &str) {
    if let Some(handle) = self.by_symbol.get(symbol) {
      handle.ref_count.fetch_add(1, Ordering::AcqRel);
    }
  }

  pub fn ref_decr(&self, symbol: &str) {
    let Some(handle) = self.by_symbol.get(symbol).map(|e| e.clone()) else {
      return;
    };
    self.release_ref(&handle);
  }

  fn release_ref(&self, handle: &SubscriptionHandle) {
    let remaining = handle.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining <= 0 {
      self.tear_down(handle);
    }
  }

  fn tear_down(&self, handle: &SubscriptionHandle) {
    self.by_symbol.remove(&handle.symbol());
    for alias in handle.aliases.read().unwrap().iter() {
      self.by_symbol.remove(alias);
    }
    if let Some(token) = handle.token() {
      self.by_token.remove(&token);
    }
  }

  /// Declares that `native` resolves to the same subscription as
  /// `generated`.
  pub fn resolve_alias(&self, generated: &str, native: &str) -> Result<()> {
    let handle = self
      .by_symbol
      .get(generated)
      .map(|e| e.clone())
      .ok_or_else(|| EngineError::UnknownSymbol { symbol: generated.to_string() })?;

    if let Some(existing) = self.by_symbol.get(native).map(|e| e.clone()) {
      if !Arc::ptr_eq(&existing, &handle) {
        self.merge(&handle, &existing, native);
      }
      return Ok(());
    }

    handle.aliases.write().unwrap().push(native.to_string());
    self.by_symbol.insert(native.to_string(), Arc::clone(&handle));
    Ok(())
  }

  /// Merge `from` into `keep`, moving callbacks and ref count, then retarget
  /// every symbol that pointed at `from`.
  fn merge(&self, keep: &SubscriptionHandle, from: &SubscriptionHandle, from_symbol: &str) {
    for entry in from.callbacks.read().unwrap().iter() {
      keep.add_callback(entry.id, entry.mode, Arc::clone(&entry.callback));
    }
    keep.ref_count.fetch_add(from.ref_count(), Ordering::AcqRel);
    keep.aliases.write().unwrap().push(from_symbol.to_string());
    self.by_symbol.insert(from_symbol.to_string(), Arc::clone(keep));
    for alias in from.aliases.read().unwrap().iter() {
      self.by_symbol.insert(alias.clone(), Arc::clone(keep));
      keep.aliases.write().unwrap().push(alias.clone());
    }
    if let Some(token) = from.token() {
      self.by_token.insert(token, Arc::clone(keep));
    }
  }

  /// Declare the native key for `symbol`, populating the authoritative
  /// token↔symbol map.
  pub fn bind_token(&self, symbol: &str, token: u32) -> Result<()> {
    let handle = self
      .by_symbol
      .entry(symbol.to_string())
      .or_insert_with(|| Arc::new(SubscriptionInner::new(symbol)))
      .clone();
    *handle.token.write().unwrap() = Some(token);
    self.by_token.insert(token, handle);
    Ok(())
  }

  pub fn lookup_by_token(&self, token: u32) -> Option<SubscriptionHandle> {
    self.by_token.get(&token).map(|e| e.clone())
  }

  pub fn lookup_by_symbol(&self, symbol: &str) -> Option<SubscriptionHandle> {
    self.by_symbol.get(symbol).map(|e| e.clone())
  }

  /// Point-in-time snapshot, never a live view (callers may iterate freely
  /// without holding any lock the write path could block on).
  pub fn iter_snapshot(&self) -> Vec<SubscriptionHandle> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for entry in self.by_symbol.iter() {
      let ptr = Arc::as_ptr(entry.value()) as usize;
      if seen.insert(ptr) {
        out.push(Arc::clone(entry.value()));
      }
    }
    out
  }

  /// All subscriptions with a positive sticky ref-count, resubscribable
  /// after a reconnect.
  pub fn resubscribable(&self) -> Vec<SubscriptionHandle> {
    self.iter_snapshot().into_iter().filter(|h| h.ref_count() > 0).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn recorder() -> (Callback, Arc<Mutex<Vec<f64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let cb: Callback = Arc::new(move |ev: TickEvent| seen2.lock().unwrap().push(ev.price));
    (cb, seen)
  }

  // Two callbacks on one symbol both observe the same ordered ticks.
  #[test]
  fn multiple_callbacks_on_one_symbol_are_independent() {
    let reg = SubscriptionRegistry::new();
    let (cb_a, seen_a) = recorder();
    let (cb_b, seen_b) = recorder();
    reg.add_callback("X", 1, Mode::LTP, cb_a).unwrap();
    reg.add_callback("X", 2, Mode::LTP, cb_b).unwrap();
    reg.bind_token("X", 99).unwrap();

    let handle = reg.lookup_by_token(99).unwrap();
    for price in [1.0, 2.0, 3.0] {
      for (_, _, cb) in handle.snapshot_callbacks().iter() {
        cb(TickEvent { mode: Mode::LTP, price, volume: None, timestamp: None, token: 99 });
      }
    }
    assert_eq!(*seen_a.lock().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(*seen_b.lock().unwrap(), vec![1.0, 2.0, 3.0]);
  }

  // Remove then re-add an id leaves other ids intact.
  #[test]
  fn remove_then_readd_preserves_other_callbacks() {
    let reg = SubscriptionRegistry::new();
    let (cb_a, seen_a) = recorder();
    let (cb_b, _seen_b) = recorder();
    reg.add_callback("X", 1, Mode::LTP, cb_a).unwrap();
    reg.add_callback("X", 2, Mode::LTP, cb_b).unwrap();
    assert!(reg.remove_callback("X", 2));

    let (cb_c, seen_c) = recorder();
    reg.add_callback("X", 2, Mode::LTP, cb_c).unwrap();

    let handle = reg.lookup_by_symbol("X").unwrap();
    let callbacks = handle.snapshot_callbacks();
    assert_eq!(callbacks.len(), 2);
    for (_, _, cb) in callbacks.iter() {
      cb(TickEvent { mode: Mode::LTP, price: 42.0, volume: None, timestamp: None, token: 0 });
    }
    assert_eq!(*seen_a.lock().unwrap(), vec![42.0]);
    assert_eq!(*seen_c.lock().unwrap(), vec![42.0]);
  }

  // Alias resolution: callback registered on a generated symbol fires
  // for ticks arriving under the resolved native symbol's token.
  #[test]
  fn alias_resolution_routes_to_same_subscription() {
    let reg = SubscriptionRegistry::new();
    let (cb, seen) = recorder();
    reg.add_callback("G", 1, Mode::LTP, cb).unwrap();
    reg.resolve_alias("G", "N").unwrap();
    reg.bind_token("N", 77).unwrap();

    let handle = reg.lookup_by_token(77).unwrap();
    for (_, _, cb) in handle.snapshot_callbacks().iter() {
      cb(TickEvent { mode: Mode::LTP, price: 10.0, volume: None, timestamp: None, token: 77 });
    }
    assert_eq!(*seen.lock().unwrap(), vec![10.0]);
  }

  #[test]
  fn unknown_symbol_creates_pending_subscription() {
    let reg = SubscriptionRegistry::new();
    let (cb, _seen) = recorder();
    reg.add_callback("NEW", 1, Mode::Quote, cb).unwrap();
    let handle = reg.lookup_by_symbol("NEW").unwrap();
    assert_eq!(handle.status(), SubscriptionStatus::Pending);
    handle.mark_live();
    assert_eq!(handle.status(), SubscriptionStatus::Live);
  }

  #[test]
  fn effective_mode_is_monotone_with_highest_requesting_callback() {
    let reg = SubscriptionRegistry::new();
    let (cb_a, _) = recorder();
    let (cb_b, _) = recorder();
    reg.add_callback("X", 1, Mode::LTP, cb_a).unwrap();
    reg.add_callback("X", 2, Mode::Full, cb_b).unwrap();
    let handle = reg.lookup_by_symbol("X").unwrap();
    assert_eq!(handle.effective_mode(), Some(Mode::Full));
  }

  #[test]
  fn sticky_subscription_survives_until_ref_count_hits_zero() {
    let reg = SubscriptionRegistry::new();
    let (cb, _) = recorder();
    reg.add_callback("X", 1, Mode::LTP, cb).unwrap();
    reg.ref_incr("X"); // extra sticky pin
    assert!(reg.remove_callback("X", 1));
    // one ref remains (the explicit pin), so the subscription must still exist.
    assert!(reg.lookup_by_symbol("X").is_some());
    reg.ref_decr("X");
    assert!(reg.lookup_by_symbol("X").is_none());
  }

  #[test]
  fn iter_snapshot_deduplicates_aliased_subscriptions() {
    let reg = SubscriptionRegistry::new();
    let (cb, _) = recorder();
    reg.add_callback("G", 1, Mode::LTP, cb).unwrap();
    reg.resolve_alias("G", "N").unwrap();
    assert_eq!(reg.iter_snapshot().len(), 1);
    let _ = AtomicUsize::new(0); // silence unused-import drift if snapshot logic grows
  }
}
