//! Top-level wiring: one `TickEngine` owns the Connection Manager, the
//! Subscription Registry, the Sharded Tick Processor, the Derived-View
//! Engine, and the Coalescing Dispatcher, and is the crate's single public
//! entry point. Wires exactly one upstream connection rather than a pool
//! (no multi-connection load balancing).

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::derived::DerivedViewEngine;
use crate::dispatch::CoalescingDispatcher;
use crate::error::Result;
use crate::registry::{Callback, CallbackId, SubscriptionRegistry};
use crate::shard::ShardRouter;
use crate::wire::Mode;

use std::sync::atomic::{AtomicU64, Ordering};

pub struct TickEngineBuilder {
  api_key: String,
  access_token: String,
  config: EngineConfig,
}

impl TickEngineBuilder {
  pub fn new(api_key: impl Into<String>, access_token: impl Into<String>) -> Self {
    Self { api_key: api_key.into(), access_token: access_token.into(), config: EngineConfig::default() }
  }

  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  pub fn build(self) -> Arc<TickEngine> {
    TickEngine::new(self.api_key, self.access_token, self.config)
  }
}

/// The crate's public façade: a single upstream WebSocket feeding a
/// sharded dispatch pipeline, an option-chain view, and a coalescing
/// output stage.
pub struct TickEngine {
  config: Arc<EngineConfig>,
  registry: Arc<SubscriptionRegistry>,
  shard_router: Arc<ShardRouter>,
  connection: Arc<ConnectionManager>,
  derived: Arc<DerivedViewEngine>,
  dispatcher: Arc<CoalescingDispatcher>,
  next_callback_id: AtomicU64,
}

impl TickEngine {
  pub fn builder(api_key: impl Into<String>, access_token: impl Into<String>) -> TickEngineBuilder {
    TickEngineBuilder::new(api_key, access_token)
  }

  fn new(api_key: String, access_token: String, config: EngineConfig) -> Arc<Self> {
    let config = Arc::new(config);
    let registry = Arc::new(SubscriptionRegistry::new());
    let shard_router = ShardRouter::start(Arc::clone(&config), Arc::clone(&registry));
    let connection = ConnectionManager::new(
      api_key,
      access_token,
      Arc::clone(&config),
      Arc::clone(&registry),
      Arc::clone(&shard_router),
    );
    let derived = DerivedViewEngine::new(Arc::clone(&registry), Arc::clone(&config));
    let dispatcher = CoalescingDispatcher::new(config.coalesce);

    Arc::new(Self {
      config,
      registry,
      shard_router,
      connection,
      derived,
      dispatcher,
      next_callback_id: AtomicU64::new(1),
    })
  }

  /// Start the connection supervisor and the coalescing flush loop.
  pub fn start(self: &Arc<Self>) {
    ConnectionManager::connect(&self.connection);
    self.dispatcher.start();
  }

  pub fn state(&self) -> ConnectionState {
    self.connection.state()
  }

  pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
    self.connection.subscribe_state()
  }

  /// Register `callback` against `symbol` at `mode`, binding its token and
  /// sending the wire subscribe request. Returns the id needed to unsubscribe.
  pub fn subscribe(&self, symbol: &str, token: u32, mode: Mode, callback: Callback) -> Result<CallbackId> {
    let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
    self.registry.add_callback(symbol, id, mode, callback)?;
    self.registry.bind_token(symbol, token)?;
    self.connection.subscribe(&[token], mode);
    Ok(id)
  }

  /// Resolve a generated alias (e.g. an instrument-master lookup symbol) to
  /// the native symbol the wire protocol actually uses.
  pub fn resolve_alias(&self, generated: &str, native: &str) -> Result<()> {
    self.registry.resolve_alias(generated, native)
  }

  pub fn unsubscribe(&self, symbol: &str, id: CallbackId) {
    let token = self.registry.lookup_by_symbol(symbol).and_then(|h| h.token());
    if self.registry.remove_callback(symbol, id) {
      if let Some(token) = token {
        if self.registry.lookup_by_token(token).is_none() {
          self.connection.unsubscribe(&[token]);
        }
      }
    }
  }

  pub fn derived(&self) -> &Arc<DerivedViewEngine> {
    &self.derived
  }

  pub fn dispatcher(&self) -> &Arc<CoalescingDispatcher> {
    &self.dispatcher
  }

  pub fn config(&self) -> &Arc<EngineConfig> {
    &self.config
  }

  pub async fn shutdown(&self) {
    self.connection.shutdown().await;
    self.shard_router.shutdown().await;
    self.dispatcher.shutdown().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn building_an_engine_starts_disconnected() {
    let engine = TickEngine::builder("key", "token").build();
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    engine.shutdown().await;
  }

  #[tokio::test]
  async fn subscribe_registers_a_callback_without_a_live_connection() {
    let engine = TickEngine::builder("key", "token").build();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    engine
      .subscribe(
        "RELIANCE",
        738561,
        Mode::LTP,
        Arc::new(move |ev| seen2.lock().unwrap().push(ev.price)),
      )
      .unwrap();

    let handle = engine.registry.lookup_by_token(738561).unwrap();
    for (_, _, cb) in handle.snapshot_callbacks().iter() {
      cb(crate::registry::TickEvent { mode: Mode::LTP, price: 42.0, volume: None, timestamp: None, token: 738561 });
    }
    assert_eq!(*seen.lock().unwrap(), vec![42.0]);
    engine.shutdown().await;
  }
}
