//! Engine-wide configuration.
//!
//! Mirrors the configuration keys an embedder can set: shard topology,
//! backpressure thresholds, market-hours gating, and the coalescing period.
//! Defaults match the documented values; [`EngineConfig::from_env`] overlays
//! `ENGINE_*` environment variables for host binaries that don't want to
//! build a config value by hand.

use crate::error::{EngineError, Result};
use crate::wire::Mode;
use std::time::Duration;

/// Backpressure tier thresholds, expressed as a fraction of shard capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureThresholds {
  pub warning_pct: u8,
  pub critical_pct: u8,
  pub emergency_pct: u8,
}

impl Default for BackpressureThresholds {
  fn default() -> Self {
    Self {
      warning_pct: 60,
      critical_pct: 80,
      emergency_pct: 90,
    }
  }
}

/// Local time-of-day window during which non-extended-hours symbols dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketWindow {
  pub open: (u8, u8),
  pub close: (u8, u8),
}

impl Default for MarketWindow {
  fn default() -> Self {
    Self {
      open: (9, 15),
      close: (15, 30),
    }
  }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Number of ring-buffer shards (recommended S = 4).
  pub shards: usize,
  /// Per-shard slot count.
  pub shard_capacity: usize,
  /// Coalescing dispatcher period.
  pub coalesce: Duration,
  /// Symbols exempt from backpressure sampling/eviction (Emergency allow-list).
  pub essential_symbols: Vec<String>,
  /// Symbol prefixes exempt from market-hours gating (e.g. "MCX", "GIFT").
  pub extended_hours_prefixes: Vec<String>,
  pub market_window: MarketWindow,
  pub backpressure: BackpressureThresholds,
  /// Callback duration above which a SlowCallback warning is logged.
  pub slow_callback: Duration,
  /// Default subscription mode applied when a caller doesn't specify one.
  pub default_mode: Mode,
  /// ε for histogram-width recomputation gating. `None` disables the guard.
  pub histogram_epsilon: Option<f64>,
  /// Price increment ticks are rounded to absent per-instrument metadata.
  pub tick_size: f64,
  pub reconnect_base_delay: Duration,
  pub reconnect_max_delay: Duration,
  pub ping_timeout: Duration,
  /// Capacity of the shared tick object pool.
  pub tick_pool_capacity: usize,
  /// Pool misses within one grace window before the processor conservatively
  /// elevates its backpressure tier by one notch.
  pub pool_miss_threshold: u64,
  /// How long a tier elevation triggered by pool pressure lasts once tripped.
  pub pool_pressure_grace: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      shards: 4,
      shard_capacity: 16_384,
      coalesce: Duration::from_millis(500),
      essential_symbols: Vec::new(),
      extended_hours_prefixes: vec!["MCX".to_string(), "GIFT".to_string()],
      market_window: MarketWindow::default(),
      backpressure: BackpressureThresholds::default(),
      slow_callback: Duration::from_millis(50),
      default_mode: Mode::Quote,
      histogram_epsilon: Some(0.01),
      tick_size: 0.05,
      reconnect_base_delay: Duration::from_secs(1),
      reconnect_max_delay: Duration::from_secs(30),
      ping_timeout: Duration::from_secs(30),
      tick_pool_capacity: 4_096,
      pool_miss_threshold: 64,
      pool_pressure_grace: Duration::from_secs(2),
    }
  }
}

impl EngineConfig {
  pub fn builder() -> EngineConfigBuilder {
    EngineConfigBuilder::default()
  }

  /// Overlay `ENGINE_*` environment variables onto the defaults.
  ///
  /// Unset variables leave the default untouched; a present-but-unparsable
  /// variable is reported as [`EngineError::Config`].
  pub fn from_env() -> Result<Self> {
    let mut cfg = Self::default();

    if let Ok(v) = std::env::var("ENGINE_SHARDS") {
      cfg.shards = v
        .parse()
        .map_err(|_| EngineError::Config(format!("ENGINE_SHARDS: invalid usize {v:?}")))?;
    }
    if let Ok(v) = std::env::var("ENGINE_SHARD_CAPACITY") {
      cfg.shard_capacity = v.parse().map_err(|_| {
        EngineError::Config(format!("ENGINE_SHARD_CAPACITY: invalid usize {v:?}"))
      })?;
    }
    if let Ok(v) = std::env::var("ENGINE_COALESCE_MS") {
      let ms: u64 = v
        .parse()
        .map_err(|_| EngineError::Config(format!("ENGINE_COALESCE_MS: invalid u64 {v:?}")))?;
      cfg.coalesce = Duration::from_millis(ms);
    }
    if let Ok(v) = std::env::var("ENGINE_ESSENTIAL_SYMBOLS") {
      cfg.essential_symbols =
        v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    }
    if let Ok(v) = std::env::var("ENGINE_EXTENDED_HOURS_PREFIXES") {
      cfg.extended_hours_prefixes =
        v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    }
    if let Ok(v) = std::env::var("ENGINE_SLOW_CALLBACK_MS") {
      let ms: u64 = v.parse().map_err(|_| {
        EngineError::Config(format!("ENGINE_SLOW_CALLBACK_MS: invalid u64 {v:?}"))
      })?;
      cfg.slow_callback = Duration::from_millis(ms);
    }

    cfg.validate()?;
    Ok(cfg)
  }

  fn validate(&self) -> Result<()> {
    if self.shards == 0 {
      return Err(EngineError::Config("shards must be >= 1".into()));
    }
    if self.shard_capacity == 0 {
      return Err(EngineError::Config("shard_capacity must be >= 1".into()));
    }
    if self.tick_size <= 0.0 {
      return Err(EngineError::Config("tick_size must be > 0".into()));
    }
    let bp = &self.backpressure;
    if !(bp.warning_pct < bp.critical_pct && bp.critical_pct < bp.emergency_pct) {
      return Err(EngineError::Config(
        "backpressure thresholds must be strictly increasing".into(),
      ));
    }
    Ok(())
  }
}

/// Fluent builder, in the style of the manager builders used throughout this crate.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
  config: OptionalOverrides,
}

#[derive(Debug, Clone, Default)]
struct OptionalOverrides {
  base: Option<EngineConfig>,
}

impl EngineConfigBuilder {
  fn base(&mut self) -> &mut EngineConfig {
    self.config.base.get_or_insert_with(EngineConfig::default)
  }

  pub fn shards(mut self, n: usize) -> Self {
    self.base().shards = n;
    self
  }

  pub fn shard_capacity(mut self, n: usize) -> Self {
    self.base().shard_capacity = n;
    self
  }

  pub fn coalesce(mut self, d: Duration) -> Self {
    self.base().coalesce = d;
    self
  }

  pub fn essential_symbols(mut self, symbols: impl IntoIterator<Item = String>) -> Self {
    self.base().essential_symbols = symbols.into_iter().collect();
    self
  }

  pub fn extended_hours_prefixes(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
    self.base().extended_hours_prefixes = prefixes.into_iter().collect();
    self
  }

  pub fn market_window(mut self, window: MarketWindow) -> Self {
    self.base().market_window = window;
    self
  }

  pub fn backpressure(mut self, thresholds: BackpressureThresholds) -> Self {
    self.base().backpressure = thresholds;
    self
  }

  pub fn slow_callback(mut self, d: Duration) -> Self {
    self.base().slow_callback = d;
    self
  }

  pub fn default_mode(mut self, mode: Mode) -> Self {
    self.base().default_mode = mode;
    self
  }

  pub fn histogram_epsilon(mut self, eps: Option<f64>) -> Self {
    self.base().histogram_epsilon = eps;
    self
  }

  pub fn tick_size(mut self, size: f64) -> Self {
    self.base().tick_size = size;
    self
  }

  pub fn tick_pool_capacity(mut self, n: usize) -> Self {
    self.base().tick_pool_capacity = n;
    self
  }

  pub fn pool_miss_threshold(mut self, n: u64) -> Self {
    self.base().pool_miss_threshold = n;
    self
  }

  pub fn pool_pressure_grace(mut self, d: Duration) -> Self {
    self.base().pool_pressure_grace = d;
    self
  }

  pub fn build(mut self) -> Result<EngineConfig> {
    let cfg = self.config.base.take().unwrap_or_default();
    cfg.validate()?;
    Ok(cfg)
  }
}
