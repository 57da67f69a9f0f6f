#![allow(clippy::cognitive_complexity, clippy::large_enum_variant)]
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![doc(test(
  no_crate_inject,
  attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! # tick-engine
//!
//! A single-connection market-tick ingestion and fan-out engine: a
//! WebSocket feed decoded by a binary frame codec, routed through a
//! sharded, backpressure-aware dispatch pipeline, and projected onto a
//! derived option-chain view with a coalescing output stage for bursty
//! consumers.
//!
//! ## Architecture
//!
//! - [`wire`] — frame codec: binary tick decoding, JSON subscribe/mode
//!   request encoding.
//! - [`connection`] — the single upstream WebSocket and its reconnect state
//!   machine.
//! - [`registry`] — the authoritative token↔symbol map and per-symbol
//!   callback fan-out set.
//! - [`shard`] — bounded per-symbol queues with tiered backpressure and one
//!   worker task per shard.
//! - [`derived`] — option-chain rows: synthetic straddle pricing, ATM
//!   selection, histogram scaling, VWAP comparison.
//! - [`dispatch`] — coalesces bursty updates into periodic snapshot batches.
//! - [`engine`] — [`TickEngine`], the façade wiring the above together.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tick_engine::{TickEngine, Mode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = TickEngine::builder("api_key", "access_token").build();
//!     engine.start();
//!
//!     engine
//!         .subscribe("RELIANCE", 738561, Mode::Quote, std::sync::Arc::new(|tick| {
//!             println!("RELIANCE @ {}", tick.price);
//!         }))
//!         .unwrap();
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     engine.shutdown().await;
//! }
//! ```

pub mod config;
pub mod connection;
pub mod derived;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod registry;
pub mod shard;
pub mod wire;

pub use config::EngineConfig;
pub use connection::ConnectionState;
pub use derived::{ChainRow, DerivedEvent, DerivedViewEngine};
pub use dispatch::{CoalescedUpdate, CoalescingDispatcher};
pub use engine::{TickEngine, TickEngineBuilder};
pub use error::{EngineError, Result};
pub use registry::{Callback, CallbackId, TickEvent};
pub use wire::Mode;
