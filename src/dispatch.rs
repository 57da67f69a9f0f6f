//! Coalescing Dispatcher: buffers the latest value per (symbol,
//! attribute) key and flushes a snapshot batch to registered sinks once per
//! period, so a bursty tick rate never queues more than one stale update
//! behind the freshest value.
//!
//! Structured like the shard workers: one background `tokio` task owns the
//! flush loop, `Notify` wakes it for shutdown, and a sink that panics is
//! caught with `catch_unwind` and disabled rather than taking the loop down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub type SinkId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedUpdate {
  pub symbol: String,
  pub attribute: String,
  pub value: f64,
  pub timestamp: Option<i64>,
}

pub type Sink = Arc<dyn Fn(&[CoalescedUpdate]) + Send + Sync>;

struct SinkEntry {
  id: SinkId,
  callback: Sink,
  enabled: AtomicBool,
}

pub struct CoalescingDispatcher {
  buffer: Mutex<HashMap<(String, String), CoalescedUpdate>>,
  sinks: RwLock<Vec<Arc<SinkEntry>>>,
  next_sink_id: AtomicU64,
  period: Duration,
  stop: Arc<Notify>,
  stopped: AtomicBool,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl CoalescingDispatcher {
  pub fn new(period: Duration) -> Arc<Self> {
    Arc::new(Self {
      buffer: Mutex::new(HashMap::new()),
      sinks: RwLock::new(Vec::new()),
      next_sink_id: AtomicU64::new(1),
      period,
      stop: Arc::new(Notify::new()),
      stopped: AtomicBool::new(false),
      worker: Mutex::new(None),
    })
  }

  /// Spawn the periodic flush loop. A no-op if already started.
  pub fn start(self: &Arc<Self>) {
    let mut worker = self.worker.lock().unwrap();
    if worker.is_some() {
      return;
    }
    let me = Arc::clone(self);
    *worker = Some(tokio::spawn(async move { me.run().await }));
  }

  async fn run(self: Arc<Self>) {
    let mut interval = tokio::time::interval(self.period);
    interval.tick().await; // first tick fires immediately; skip it.
    loop {
      tokio::select! {
        _ = interval.tick() => self.flush(),
        _ = self.stop.notified() => {
          self.flush();
          return;
        }
      }
    }
  }

  /// Overwrite the buffered value for `(symbol, attribute)`. Called from any
  /// component that produces a value a consumer might want coalesced (the
  /// Connection Manager for raw prices, the Derived-View Engine for rows).
  pub fn record(&self, symbol: &str, attribute: &str, value: f64, timestamp: Option<i64>) {
    let key = (symbol.to_string(), attribute.to_string());
    self.buffer.lock().unwrap().insert(key, CoalescedUpdate {
      symbol: symbol.to_string(),
      attribute: attribute.to_string(),
      value,
      timestamp,
    });
  }

  /// Register a sink, returning an id usable with [`CoalescingDispatcher::reset_sink`].
  pub fn register_sink(&self, callback: impl Fn(&[CoalescedUpdate]) + Send + Sync + 'static) -> SinkId {
    let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
    self.sinks.write().unwrap().push(Arc::new(SinkEntry {
      id,
      callback: Arc::new(callback),
      enabled: AtomicBool::new(true),
    }));
    id
  }

  /// Re-enable a sink previously disabled after a panic.
  pub fn reset_sink(&self, id: SinkId) {
    if let Some(entry) = self.sinks.read().unwrap().iter().find(|e| e.id == id) {
      entry.enabled.store(true, Ordering::Release);
    }
  }

  pub fn sink_enabled(&self, id: SinkId) -> bool {
    self
      .sinks
      .read()
      .unwrap()
      .iter()
      .find(|e| e.id == id)
      .map(|e| e.enabled.load(Ordering::Acquire))
      .unwrap_or(false)
  }

  /// Drain the buffer and deliver the batch to every enabled sink. Exposed
  /// directly so tests don't need to wait out a real period.
  pub fn flush(&self) {
    let batch: Vec<CoalescedUpdate> = {
      let mut buffer = self.buffer.lock().unwrap();
      buffer.drain().map(|(_, v)| v).collect()
    };
    if batch.is_empty() {
      return;
    }
    for entry in self.sinks.read().unwrap().iter() {
      if !entry.enabled.load(Ordering::Acquire) {
        continue;
      }
      let callback = Arc::clone(&entry.callback);
      let batch_ref = &batch;
      let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(batch_ref)));
      if result.is_err() {
        log::error!("coalescing sink {} panicked, disabling it", entry.id);
        entry.enabled.store(false, Ordering::Release);
      }
    }
  }

  pub async fn shutdown(&self) {
    self.stopped.store(true, Ordering::Release);
    self.stop.notify_waiters();
    let handle = self.worker.lock().unwrap().take();
    if let Some(handle) = handle {
      let _ = handle.await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn later_writes_to_the_same_key_overwrite_rather_than_queue() {
    let dispatcher = CoalescingDispatcher::new(Duration::from_millis(500));
    dispatcher.record("NIFTY", "last_price", 100.0, Some(1));
    dispatcher.record("NIFTY", "last_price", 101.0, Some(2));
    dispatcher.record("NIFTY", "volume", 5.0, Some(2));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    dispatcher.register_sink(move |batch| seen2.lock().unwrap().extend_from_slice(batch));
    dispatcher.flush();

    let batch = seen.lock().unwrap();
    assert_eq!(batch.len(), 2);
    let last_price = batch.iter().find(|u| u.attribute == "last_price").unwrap();
    assert_eq!(last_price.value, 101.0);
  }

  #[test]
  fn an_empty_buffer_never_invokes_sinks() {
    let dispatcher = CoalescingDispatcher::new(Duration::from_millis(500));
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    dispatcher.register_sink(move |_| {
      calls2.fetch_add(1, Ordering::SeqCst);
    });
    dispatcher.flush();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn a_panicking_sink_is_disabled_and_other_sinks_still_run() {
    let dispatcher = CoalescingDispatcher::new(Duration::from_millis(500));
    dispatcher.record("X", "last_price", 1.0, None);

    let panicking = dispatcher.register_sink(|_| panic!("boom"));
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    dispatcher.register_sink(move |_| {
      calls2.fetch_add(1, Ordering::SeqCst);
    });

    dispatcher.flush();
    assert!(!dispatcher.sink_enabled(panicking));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    dispatcher.record("X", "last_price", 2.0, None);
    dispatcher.flush();
    // The disabled sink does not run again until explicitly reset.
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    dispatcher.reset_sink(panicking);
    assert!(dispatcher.sink_enabled(panicking));
  }

  #[tokio::test]
  async fn start_and_shutdown_join_the_flush_loop_cleanly() {
    let dispatcher = CoalescingDispatcher::new(Duration::from_millis(20));
    dispatcher.record("X", "last_price", 1.0, None);
    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = Arc::clone(&seen);
    dispatcher.register_sink(move |batch| {
      seen2.fetch_add(batch.len(), Ordering::SeqCst);
    });

    dispatcher.start();
    tokio::time::sleep(Duration::from_millis(60)).await;
    dispatcher.shutdown().await;

    assert!(seen.load(Ordering::SeqCst) >= 1);
  }
}
