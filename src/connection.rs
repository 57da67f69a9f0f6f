//! Connection Manager: the single upstream WebSocket, its state
//! machine, and subscription replay across reconnects.
//!
//! Split into a writer task draining a command channel, a reader task
//! pulling frames off the socket, and a decode+route step that also
//! performs registry lookup and shard routing for each incoming frame.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::registry::SubscriptionRegistry;
use crate::shard::{DropReason, EnqueueOutcome, ShardRouter};
use crate::wire::{self, Mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
  Failed,
}

pub struct ConnectionManager {
  api_key: String,
  access_token: String,
  config: Arc<EngineConfig>,
  registry: Arc<SubscriptionRegistry>,
  shard_router: Arc<ShardRouter>,
  state_tx: watch::Sender<ConnectionState>,
  cmd_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
  pending: Mutex<Vec<(Vec<u32>, Mode)>>,
  stop: Arc<Notify>,
  stopped: Arc<std::sync::atomic::AtomicBool>,
  supervisor: Mutex<Option<JoinHandle<()>>>,
  warned_unknown: Mutex<HashSet<u32>>,
  attempt: AtomicU32,
}

impl ConnectionManager {
  pub fn new(
    api_key: impl Into<String>,
    access_token: impl Into<String>,
    config: Arc<EngineConfig>,
    registry: Arc<SubscriptionRegistry>,
    shard_router: Arc<ShardRouter>,
  ) -> Arc<Self> {
    let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
    Arc::new(Self {
      api_key: api_key.into(),
      access_token: access_token.into(),
      config,
      registry,
      shard_router,
      state_tx,
      cmd_tx: Mutex::new(None),
      pending: Mutex::new(Vec::new()),
      stop: Arc::new(Notify::new()),
      stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
      supervisor: Mutex::new(None),
      warned_unknown: Mutex::new(HashSet::new()),
      attempt: AtomicU32::new(0),
    })
  }

  pub fn state(&self) -> ConnectionState {
    *self.state_tx.borrow()
  }

  /// Observe state transitions.
  pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
    self.state_tx.subscribe()
  }

  fn set_state(&self, state: ConnectionState) {
    log::info!("connection state -> {state:?}");
    let _ = self.state_tx.send(state);
  }

  /// Start the connection supervisor loop (reconnect-forever state machine).
  /// Takes the owning `Arc` explicitly since the supervisor task outlives
  /// any single method call.
  pub fn connect(engine: &Arc<Self>) {
    let me = Arc::clone(engine);
    let handle = tokio::spawn(async move { me.run().await });
    *engine.supervisor.lock().unwrap() = Some(handle);
  }

  async fn run(self: Arc<Self>) {
    loop {
      if self.stopped.load(Ordering::Acquire) {
        self.set_state(ConnectionState::Disconnected);
        return;
      }

      self.set_state(ConnectionState::Connecting);
      match self.connect_once().await {
        Ok(()) => {
          // connect_once only returns after the socket has dropped.
          if self.stopped.load(Ordering::Acquire) {
            self.set_state(ConnectionState::Disconnected);
            return;
          }
          self.attempt.store(0, Ordering::Release);
          self.set_state(ConnectionState::Reconnecting);
        }
        Err(EngineError::AuthFailure(reason)) => {
          log::error!("authentication failed, giving up: {reason}");
          self.set_state(ConnectionState::Failed);
          return;
        }
        Err(e) => {
          log::warn!("connection attempt failed: {e}");
          self.set_state(ConnectionState::Reconnecting);
        }
      }

      let delay = self.backoff_delay();
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = self.stop.notified() => {
          self.set_state(ConnectionState::Disconnected);
          return;
        }
      }
    }
  }

  fn backoff_delay(&self) -> Duration {
    let attempt = self.attempt.fetch_add(1, Ordering::AcqRel);
    let base = self.config.reconnect_base_delay.as_millis() as u64;
    let max = self.config.reconnect_max_delay.as_millis() as u64;
    let unjittered = base.saturating_mul(1u64 << attempt.min(10)).min(max);
    let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = (unjittered as f64 * (1.0 + jitter_fraction)).max(0.0) as u64;
    Duration::from_millis(jittered)
  }

  /// One connection lifetime: connects, runs reader/writer tasks to
  /// completion, and returns once the socket closes for any non-fatal
  /// reason. Authentication rejection is the only case surfaced as `Err`.
  async fn connect_once(&self) -> Result<()> {
    let mut url = url::Url::parse("wss://ws.kite.trade")
      .map_err(|e| EngineError::TransportError(e.to_string()))?;
    {
      let mut qp = url.query_pairs_mut();
      qp.append_pair("api_key", &self.api_key);
      qp.append_pair("access_token", &self.access_token);
    }

    let (ws_stream, _resp) = connect_async(url.as_str()).await.map_err(|e| match e {
      tokio_tungstenite::tungstenite::Error::Http(response)
        if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
      {
        EngineError::AuthFailure(format!("handshake rejected: {}", response.status()))
      }
      other => EngineError::TransportError(other.to_string()),
    })?;

    let (write_half, mut read_half) = ws_stream.split();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Message>();
    *self.cmd_tx.lock().unwrap() = Some(cmd_tx.clone());

    let mut write = write_half;
    let writer = tokio::spawn(async move {
      while let Some(msg) = cmd_rx.recv().await {
        if write.send(msg).await.is_err() {
          break;
        }
      }
    });

    self.set_state(ConnectionState::Connected);
    self.flush_pending(&cmd_tx);
    self.resubscribe_all(&cmd_tx);

    let ping_timeout = self.config.ping_timeout;
    loop {
      let next = tokio::time::timeout(ping_timeout, read_half.next());
      let message = tokio::select! {
        res = next => res,
        _ = self.stop.notified() => {
          let _ = cmd_tx.send(Message::Close(None));
          break;
        }
      };

      match message {
        Err(_elapsed) => {
          log::warn!("no message from upstream within {ping_timeout:?}, reconnecting");
          break;
        }
        Ok(None) => break,
        Ok(Some(Err(e))) => {
          log::warn!("websocket read error: {e}");
          break;
        }
        Ok(Some(Ok(Message::Binary(bytes)))) => self.handle_frame(&bytes),
        Ok(Some(Ok(Message::Close(_)))) => break,
        Ok(Some(Ok(_))) => {} // text/ping/pong control frames carry no ticks here.
      }
    }

    *self.cmd_tx.lock().unwrap() = None;
    drop(cmd_tx);
    let _ = writer.await;
    Ok(())
  }

  fn handle_frame(&self, frame: &[u8]) {
    let ticks = match wire::decode(frame) {
      Ok(ticks) => ticks,
      Err(e) => {
        log::warn!("dropping malformed frame: {e}");
        return;
      }
    };

    for tick in ticks {
      let Some(handle) = self.registry.lookup_by_token(tick.instrument_token) else {
        let mut warned = self.warned_unknown.lock().unwrap();
        if warned.insert(tick.instrument_token) {
          log::warn!("tick for unknown token {}", tick.instrument_token);
        }
        continue;
      };
      let token = tick.instrument_token;
      if let EnqueueOutcome::Dropped(DropReason::Maximum) = self.shard_router.queue_tick(handle, tick) {
        log::warn!("shard buffer full, dropping tick for token {token}");
      }
    }
  }

  fn flush_pending(&self, cmd_tx: &mpsc::UnboundedSender<Message>) {
    let pending = std::mem::take(&mut *self.pending.lock().unwrap());
    for (tokens, mode) in pending {
      send_subscribe(cmd_tx, &tokens, mode);
    }
  }

  /// Resubscribe the union of ref-counted subscriptions, batched, at each
  /// token's highest effective mode.
  fn resubscribe_all(&self, cmd_tx: &mpsc::UnboundedSender<Message>) {
    let mut by_mode: HashMap<Mode, Vec<u32>> = HashMap::new();
    for handle in self.registry.resubscribable() {
      let Some(token) = handle.token() else { continue };
      let mode = handle.effective_mode().unwrap_or(self.config.default_mode);
      by_mode.entry(mode).or_default().push(token);
    }
    for (mode, tokens) in by_mode {
      if !tokens.is_empty() {
        log::info!("resubscribing {} tokens at {mode:?}", tokens.len());
        send_subscribe(cmd_tx, &tokens, mode);
      }
    }
  }

  /// Subscribe `tokens` at `mode`. Buffered if not currently connected.
  pub fn subscribe(&self, tokens: &[u32], mode: Mode) {
    match self.cmd_tx.lock().unwrap().as_ref() {
      Some(tx) => send_subscribe(tx, tokens, mode),
      None => self.pending.lock().unwrap().push((tokens.to_vec(), mode)),
    }
  }

  pub fn unsubscribe(&self, tokens: &[u32]) {
    if let Some(tx) = self.cmd_tx.lock().unwrap().as_ref() {
      for frame in wire::encode_unsubscribe(tokens) {
        let _ = tx.send(Message::Text(frame.into()));
      }
    }
    self.pending.lock().unwrap().retain(|(t, _)| !t.iter().any(|x| tokens.contains(x)));
  }

  /// Disconnect, stop reconnecting, and wait for the supervisor to exit.
  pub async fn shutdown(&self) {
    self.stopped.store(true, Ordering::Release);
    self.stop.notify_waiters();
    let handle = self.supervisor.lock().unwrap().take();
    if let Some(handle) = handle {
      let _ = handle.await;
    }
  }
}

fn send_subscribe(cmd_tx: &mpsc::UnboundedSender<Message>, tokens: &[u32], mode: Mode) {
  for frame in wire::encode_subscribe(tokens, mode) {
    let _ = cmd_tx.send(Message::Text(frame.into()));
  }
}
