use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::parser::{price, value};
use super::{Depth, Mode, Ohlc, Segment};

#[derive(Debug, Clone)]
pub struct TickParseError(pub String);

impl fmt::Display for TickParseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::error::Error for TickParseError {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// A single decoded market-data packet.
///
/// Immutable once constructed; the mode reflects the richest section that
/// could be parsed out of the packet's declared length.
pub struct Tick {
  pub mode: Mode,
  pub instrument_token: u32,
  pub segment: Segment,
  pub is_index: bool,

  pub last_price: Option<f64>,
  pub last_traded_qty: Option<u32>,
  pub avg_traded_price: Option<f64>,
  pub volume_traded: Option<u32>,
  pub total_buy_qty: Option<u32>,
  pub total_sell_qty: Option<u32>,
  pub ohlc: Option<Ohlc>,
  pub net_change: Option<f64>,

  pub last_traded_timestamp: Option<Duration>,
  pub oi: Option<u32>,
  pub oi_day_high: Option<u32>,
  pub oi_day_low: Option<u32>,
  pub exchange_timestamp: Option<Duration>,
  pub depth: Option<Depth>,
}

impl Tick {
  fn from_bytes(input: &[u8]) -> Self {
    let mut tick = Tick {
      instrument_token: value(&input[0..4]).unwrap_or_default(),
      ..Tick::default()
    };
    tick.segment = Segment::from(tick.instrument_token);
    tick.is_index = tick.segment.is_index();

    // LTP section: bytes 4..8.
    if let Some(bs) = input.get(4..8) {
      tick.mode = Mode::LTP;
      tick.last_price = price(bs, tick.segment);
    }

    // Quote section.
    if tick.is_index {
      if let Some(bs) = input.get(8..28) {
        tick.mode = Mode::Quote;
        tick.ohlc = Ohlc::from_index(&bs[0..16], tick.segment);
        tick.net_change = price(&bs[16..20], tick.segment);
      }
    } else if let Some(bs) = input.get(8..44) {
      tick.mode = Mode::Quote;
      tick.last_traded_qty = value(&bs[0..4]);
      tick.avg_traded_price = price(&bs[4..8], tick.segment);
      tick.volume_traded = value(&bs[8..12]);
      tick.total_buy_qty = value(&bs[12..16]);
      tick.total_sell_qty = value(&bs[16..20]);
      tick.ohlc = Ohlc::from_equity(&bs[20..36], tick.segment);
    }

    // Full section.
    if tick.is_index {
      if let Some(bs) = input.get(28..32) {
        tick.mode = Mode::Full;
        tick.exchange_timestamp = value(bs).map(|s| Duration::from_secs(s.into()));
      }
    } else if let Some(bs) = input.get(44..184) {
      tick.mode = Mode::Full;
      tick.net_change = tick.ohlc.as_ref().and_then(|o| {
        let last = tick.last_price?;
        (o.close != 0.0).then_some(last - o.close)
      });

      tick.last_traded_timestamp = value(&bs[0..4]).map(|s| Duration::from_secs(s.into()));
      tick.oi = value(&bs[4..8]);
      tick.oi_day_high = value(&bs[8..12]);
      tick.oi_day_low = value(&bs[12..16]);
      tick.exchange_timestamp = value(&bs[16..20]).map(|s| Duration::from_secs(s.into()));
      tick.depth = Depth::from(&bs[20..140], tick.segment);
    }

    tick
  }
}

impl TryFrom<&[u8]> for Tick {
  type Error = TickParseError;

  fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
    match bytes.len() {
      8 | 28 | 32 | 44 | 184 => Ok(Tick::from_bytes(bytes)),
      len => Err(TickParseError(format!("invalid tick packet size: {len}"))),
    }
  }
}
