use serde::{Deserialize, Serialize};

use super::parser::price;
use super::Segment;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
}

impl Ohlc {
  pub(crate) fn from_equity(bs: &[u8], segment: Segment) -> Option<Self> {
    bs.get(0..16).map(|b| Ohlc {
      open: price(&b[0..4], segment).unwrap_or_default(),
      high: price(&b[4..8], segment).unwrap_or_default(),
      low: price(&b[8..12], segment).unwrap_or_default(),
      close: price(&b[12..16], segment).unwrap_or_default(),
    })
  }

  /// Index packets carry OHLC in high/low/open/close wire order.
  pub(crate) fn from_index(bs: &[u8], segment: Segment) -> Option<Self> {
    bs.get(0..16).map(|b| Ohlc {
      high: price(&b[0..4], segment).unwrap_or_default(),
      low: price(&b[4..8], segment).unwrap_or_default(),
      open: price(&b[8..12], segment).unwrap_or_default(),
      close: price(&b[12..16], segment).unwrap_or_default(),
    })
  }
}
