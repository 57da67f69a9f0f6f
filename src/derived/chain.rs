//! Derived-View Engine: option-chain rows built on top of the
//! Subscription Registry, tracking synthetic straddle pricing, the
//! at-the-money strike, histogram scaling, and VWAP comparisons.
//!
//! Rows subscribe through the registry exactly like any other consumer —
//! the engine owns no socket or shard state of its own, only a set of callback
//! closures the registry invokes on tick. Rebuilding the chain removes the
//! old callback ids from the registry before installing new ones, and every
//! closure carries the generation it was built under so a late tick from a
//! torn-down row is a safe no-op rather than a stale-state write.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::EngineConfig;
use crate::derived::symbol::{self, OptionKind};
use crate::error::Result;
use crate::registry::{CallbackId, SubscriptionRegistry, TickEvent};

fn strike_key(strike: f64) -> i64 {
  (strike * 100.0).round() as i64
}

fn now_ts() -> i64 {
  chrono::Utc::now().timestamp()
}

fn comparison(last: f64, vwap: f64) -> i8 {
  if last > vwap {
    1
  } else if last < vwap {
    -1
  } else {
    0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegKind {
  Ce,
  Pe,
  Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
  Pending,
  Live,
}

#[derive(Debug, Clone, Default)]
pub struct LegState {
  pub symbol: Option<String>,
  pub last: Option<f64>,
  pub last_update: Option<i64>,
  pub vwap: Option<f64>,
  pub vwap_comparison: Option<i8>,
  pub histogram_width: Option<f64>,
}

impl LegState {
  pub fn status(&self) -> RowStatus {
    if self.last.is_some() {
      RowStatus::Live
    } else {
      RowStatus::Pending
    }
  }
}

#[derive(Debug, Clone)]
pub struct ChainRow {
  pub strike: f64,
  pub ce: LegState,
  pub pe: LegState,
  pub straddle: Option<f64>,
  pub straddle_vwap_comparison: Option<i8>,
  pub is_atm: bool,
  composite_symbol: String,
  composite_last: Option<f64>,
  composite_last_update: Option<i64>,
  composite_vwap: Option<f64>,
  ce_cb_id: CallbackId,
  pe_cb_id: CallbackId,
  composite_cb_id: CallbackId,
}

/// A single mutated field on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowField {
  CeLast,
  PeLast,
  Straddle,
  IsAtm,
  HistogramWidth,
  CeVwap,
  PeVwap,
  StraddleVwap,
}

#[derive(Debug, Clone)]
pub struct RowChange {
  pub strike_key: i64,
  pub fields: Vec<RowField>,
}

#[derive(Debug, Clone)]
pub enum DerivedEvent {
  ChainBuilt { underlying: String, strikes: Vec<f64> },
  RowChanged(RowChange),
}

pub type DerivedListener = Arc<dyn Fn(DerivedEvent) + Send + Sync>;

struct ChainState {
  rows: BTreeMap<i64, ChainRow>,
  max_leg_price: f64,
  atm_strike_key: Option<i64>,
}

/// Owns the currently displayed option chain and recomputes its derived
/// fields as leg and VWAP ticks arrive.
pub struct DerivedViewEngine {
  registry: Arc<SubscriptionRegistry>,
  config: Arc<EngineConfig>,
  state: RwLock<Option<ChainState>>,
  symbol_index: RwLock<HashMap<String, (i64, LegKind)>>,
  generation: AtomicU64,
  next_callback_id: AtomicU64,
  listeners: RwLock<Vec<DerivedListener>>,
}

impl DerivedViewEngine {
  pub fn new(registry: Arc<SubscriptionRegistry>, config: Arc<EngineConfig>) -> Arc<Self> {
    Arc::new(Self {
      registry,
      config,
      state: RwLock::new(None),
      symbol_index: RwLock::new(HashMap::new()),
      generation: AtomicU64::new(0),
      next_callback_id: AtomicU64::new(1),
      listeners: RwLock::new(Vec::new()),
    })
  }

  pub fn on_event(&self, listener: impl Fn(DerivedEvent) + Send + Sync + 'static) {
    self.listeners.write().unwrap().push(Arc::new(listener));
  }

  fn emit(&self, event: DerivedEvent) {
    for listener in self.listeners.read().unwrap().iter() {
      let listener = Arc::clone(listener);
      let event = event.clone();
      if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(event))).is_err() {
        log::error!("derived-view listener panicked, dropping this notification");
      }
    }
  }

  /// Rebuild the chain wholesale: unsubscribe every row of the previous
  /// definition, then build and subscribe fresh rows for `strikes`.
  ///
  /// Takes the owning `Arc` explicitly (rather than as a `self` receiver,
  /// which `&Arc<Self>` cannot be on stable Rust) since installing a leg
  /// callback needs an owned `Arc` to move into the closure the registry holds.
  pub fn build_chain(
    engine: &Arc<Self>,
    underlying: &str,
    expiry_year_2d: u8,
    expiry_month: u32,
    strikes: &[f64],
  ) -> Result<()> {
    let generation = engine.generation.fetch_add(1, Ordering::AcqRel) + 1;

    if let Some(old) = engine.state.write().unwrap().take() {
      for row in old.rows.values() {
        if let Some(sym) = row.ce.symbol.as_deref() {
          engine.registry.remove_callback(sym, row.ce_cb_id);
        }
        if let Some(sym) = row.pe.symbol.as_deref() {
          engine.registry.remove_callback(sym, row.pe_cb_id);
        }
        engine.registry.remove_callback(&row.composite_symbol, row.composite_cb_id);
      }
    }

    let mut rows = BTreeMap::new();
    let mut symbol_index = HashMap::new();

    for &strike in strikes {
      let key = strike_key(strike);
      let ce_symbol = symbol::format_leg(underlying, expiry_year_2d, expiry_month, strike, OptionKind::Call);
      let pe_symbol = symbol::format_leg(underlying, expiry_year_2d, expiry_month, strike, OptionKind::Put);
      let composite_symbol = symbol::format_straddle(underlying, expiry_year_2d, expiry_month, strike);

      let ce_cb_id = engine.next_callback_id.fetch_add(1, Ordering::Relaxed);
      let pe_cb_id = engine.next_callback_id.fetch_add(1, Ordering::Relaxed);
      let composite_cb_id = engine.next_callback_id.fetch_add(1, Ordering::Relaxed);

      Self::install_leg_callback(engine, &ce_symbol, ce_cb_id, generation, key, LegKind::Ce)?;
      Self::install_leg_callback(engine, &pe_symbol, pe_cb_id, generation, key, LegKind::Pe)?;
      Self::install_leg_callback(engine, &composite_symbol, composite_cb_id, generation, key, LegKind::Composite)?;

      symbol_index.insert(ce_symbol.clone(), (key, LegKind::Ce));
      symbol_index.insert(pe_symbol.clone(), (key, LegKind::Pe));
      symbol_index.insert(composite_symbol.clone(), (key, LegKind::Composite));

      rows.insert(
        key,
        ChainRow {
          strike,
          ce: LegState { symbol: Some(ce_symbol), ..Default::default() },
          pe: LegState { symbol: Some(pe_symbol), ..Default::default() },
          straddle: None,
          straddle_vwap_comparison: None,
          is_atm: false,
          composite_symbol,
          composite_last: None,
          composite_last_update: None,
          composite_vwap: None,
          ce_cb_id,
          pe_cb_id,
          composite_cb_id,
        },
      );
    }

    *engine.symbol_index.write().unwrap() = symbol_index;
    *engine.state.write().unwrap() = Some(ChainState { rows, max_leg_price: 0.0, atm_strike_key: None });

    engine.emit(DerivedEvent::ChainBuilt { underlying: underlying.to_string(), strikes: strikes.to_vec() });
    Ok(())
  }

  fn install_leg_callback(
    engine: &Arc<Self>,
    symbol: &str,
    id: CallbackId,
    generation: u64,
    key: i64,
    leg: LegKind,
  ) -> Result<()> {
    let me = Arc::clone(engine);
    engine.registry.add_callback(
      symbol,
      id,
      engine.config.default_mode,
      Arc::new(move |ev: TickEvent| me.on_tick(generation, key, leg, ev.price, ev.timestamp)),
    )
  }

  fn on_tick(&self, generation: u64, key: i64, leg: LegKind, price: f64, timestamp: Option<i64>) {
    if self.generation.load(Ordering::Acquire) != generation {
      return; // stale row from a chain rebuilt since this callback was installed.
    }

    let mut guard = self.state.write().unwrap();
    let Some(state) = guard.as_mut() else { return };
    if !state.rows.contains_key(&key) {
      return;
    }

    let mut own_changed = Vec::new();
    {
      let row = state.rows.get_mut(&key).unwrap();
      match leg {
        LegKind::Ce => {
          row.ce.last = Some(price);
          row.ce.last_update = timestamp;
          own_changed.push(RowField::CeLast);
        }
        LegKind::Pe => {
          row.pe.last = Some(price);
          row.pe.last_update = timestamp;
          own_changed.push(RowField::PeLast);
        }
        LegKind::Composite => {
          row.composite_last = Some(price);
          row.composite_last_update = timestamp;
        }
      }
      let straddle = compute_straddle(row);
      if straddle != row.straddle {
        row.straddle = straddle;
        own_changed.push(RowField::Straddle);
      }
    }

    let atm_flipped = recompute_atm(state);
    let histogram_flipped = recompute_histogram(state, self.config.histogram_epsilon);

    let mut per_row: BTreeMap<i64, Vec<RowField>> = BTreeMap::new();
    if !own_changed.is_empty() {
      per_row.entry(key).or_default().extend(own_changed);
    }
    for k in atm_flipped {
      per_row.entry(k).or_default().push(RowField::IsAtm);
    }
    for k in histogram_flipped {
      per_row.entry(k).or_default().push(RowField::HistogramWidth);
    }
    drop(guard);

    for (strike_key, fields) in per_row {
      self.emit(DerivedEvent::RowChanged(RowChange { strike_key, fields }));
    }
  }

  /// Apply a VWAP update for any leg or composite symbol known to the chain.
  pub fn on_vwap(&self, symbol: &str, vwap: f64) {
    let Some((key, leg)) = self.symbol_index.read().unwrap().get(symbol).copied() else { return };
    let mut guard = self.state.write().unwrap();
    let Some(state) = guard.as_mut() else { return };
    let Some(row) = state.rows.get_mut(&key) else { return };

    let field = match leg {
      LegKind::Ce => {
        row.ce.vwap = Some(vwap);
        row.ce.vwap_comparison = row.ce.last.map(|p| comparison(p, vwap));
        RowField::CeVwap
      }
      LegKind::Pe => {
        row.pe.vwap = Some(vwap);
        row.pe.vwap_comparison = row.pe.last.map(|p| comparison(p, vwap));
        RowField::PeVwap
      }
      LegKind::Composite => {
        row.composite_vwap = Some(vwap);
        row.straddle_vwap_comparison = row.straddle.map(|p| comparison(p, vwap));
        RowField::StraddleVwap
      }
    };
    drop(guard);
    self.emit(DerivedEvent::RowChanged(RowChange { strike_key: key, fields: vec![field] }));
  }

  pub fn snapshot(&self) -> Vec<ChainRow> {
    match self.state.read().unwrap().as_ref() {
      Some(state) => state.rows.values().cloned().collect(),
      None => Vec::new(),
    }
  }

  pub fn atm_strike(&self) -> Option<f64> {
    let guard = self.state.read().unwrap();
    let state = guard.as_ref()?;
    let key = state.atm_strike_key?;
    state.rows.get(&key).map(|r| r.strike)
  }
}

/// Prefer a composite tick that arrived within the last second; else the
/// sum of both legs once both are positive; else undefined.
fn compute_straddle(row: &ChainRow) -> Option<f64> {
  let composite_fresh = matches!(
    (row.composite_last, row.composite_last_update),
    (Some(_), Some(t)) if now_ts() - t <= 1
  );
  if composite_fresh {
    return row.composite_last;
  }
  match (row.ce.last, row.pe.last) {
    (Some(ce), Some(pe)) if ce > 0.0 && pe > 0.0 => Some(ce + pe),
    _ => None,
  }
}

/// Minimize CE_last + PE_last over rows where both legs are positive;
/// ties resolve to the lower strike. Returns the strikes whose ATM flag flipped.
fn recompute_atm(state: &mut ChainState) -> Vec<i64> {
  let mut best: Option<(i64, f64)> = None;
  for (&key, row) in state.rows.iter() {
    if let (Some(ce), Some(pe)) = (row.ce.last, row.pe.last) {
      if ce > 0.0 && pe > 0.0 {
        let sum = ce + pe;
        best = match best {
          None => Some((key, sum)),
          Some((best_key, best_sum)) if sum < best_sum || (sum == best_sum && key < best_key) => {
            Some((key, sum))
          }
          other => other,
        };
      }
    }
  }
  let new_atm = best.map(|(key, _)| key);
  if new_atm == state.atm_strike_key {
    return Vec::new();
  }

  let mut flipped = Vec::new();
  for (&key, row) in state.rows.iter_mut() {
    let should_be_atm = Some(key) == new_atm;
    if row.is_atm != should_be_atm {
      row.is_atm = should_be_atm;
      flipped.push(key);
    }
  }
  state.atm_strike_key = new_atm;
  flipped
}

/// The whole histogram only recomputes when the chain-wide max leg price
/// moves by at least `epsilon`; a `None` epsilon recomputes unconditionally.
fn recompute_histogram(state: &mut ChainState, epsilon: Option<f64>) -> Vec<i64> {
  let max = state
    .rows
    .values()
    .flat_map(|r| [r.ce.last, r.pe.last])
    .flatten()
    .fold(0.0_f64, f64::max);
  if max <= 0.0 {
    return Vec::new();
  }
  let should_recompute = epsilon.map_or(true, |eps| (max - state.max_leg_price).abs() >= eps);
  if !should_recompute {
    return Vec::new();
  }
  state.max_leg_price = max;

  let mut changed = Vec::new();
  for (&key, row) in state.rows.iter_mut() {
    let mut row_changed = false;
    let ce_width = row.ce.last.map(|p| (p / max * 100.0).clamp(0.0, 100.0));
    if ce_width != row.ce.histogram_width {
      row.ce.histogram_width = ce_width;
      row_changed = true;
    }
    let pe_width = row.pe.last.map(|p| (p / max * 100.0).clamp(0.0, 100.0));
    if pe_width != row.pe.histogram_width {
      row.pe.histogram_width = pe_width;
      row_changed = true;
    }
    if row_changed {
      changed.push(key);
    }
  }
  changed
}
