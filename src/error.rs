//! Typed error hierarchy for the tick engine.
//!
//! Every fallible public operation in the crate returns `Result<T, EngineError>`
//! instead of an ad-hoc `String`, so embedders can match on error kind.

use thiserror::Error;

#[derive(Debug, Error)]
/// Errors surfaced by the tick engine to its embedder.
///
/// Most of these are logged and handled locally (see each component's
/// module docs); only [`EngineError::AuthFailure`] and sustained
/// [`EngineError::BufferFull`] are meant to reach an operator.
pub enum EngineError {
  /// A binary container failed to decode; the whole container was dropped.
  #[error("malformed frame: {reason}")]
  MalformedFrame { reason: String },

  /// A shard's ring buffer rejected an enqueue at the Maximum backpressure tier.
  #[error("shard {shard} buffer full")]
  BufferFull { shard: usize },

  /// A tick arrived for a token the registry has never heard of.
  #[error("tick for unknown token {token}")]
  UnknownToken { token: u32 },

  /// An operation referenced a symbol with no subscription on record.
  #[error("no subscription registered for {symbol}")]
  UnknownSymbol { symbol: String },

  /// A subscription exists but has not received its first tick yet.
  #[error("subscription for {symbol} is not live")]
  NotLive { symbol: String },

  /// The upstream transport failed or dropped; the connection state machine handles this.
  #[error("transport error: {0}")]
  TransportError(String),

  /// The broker rejected credentials; terminal until external refresh.
  #[error("authentication failed: {0}")]
  AuthFailure(String),

  /// A coalescing sink callback failed; the sink has been disabled.
  #[error("sink {sink_id} faulted and was disabled")]
  SinkFault { sink_id: u64 },

  /// An operation was attempted after `shutdown()` completed.
  #[error("engine is shutting down")]
  Shuttingdown,

  /// Configuration failed validation.
  #[error("invalid configuration: {0}")]
  Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
