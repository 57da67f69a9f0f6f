use serde::{Deserialize, Serialize};

use super::parser::{price, value, value_short};
use super::Segment;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
  pub qty: u32,
  pub price: f64,
  pub orders: u16,
}

impl DepthLevel {
  fn from(bs: &[u8], segment: Segment) -> Option<Self> {
    bs.get(0..10).map(|b| DepthLevel {
      qty: value(&b[0..4]).unwrap_or_default(),
      price: price(&b[4..8], segment).unwrap_or_default(),
      orders: value_short(&b[8..10]).unwrap_or_default(),
    })
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Up to five bid/ask levels, per the Full-mode wire layout.
pub struct Depth {
  pub buy: [DepthLevel; 5],
  pub sell: [DepthLevel; 5],
}

impl Depth {
  pub(crate) fn from(bs: &[u8], segment: Segment) -> Option<Self> {
    let bs = bs.get(0..120)?;
    let mut depth = Depth::default();
    for i in 0..5 {
      depth.buy[i] = DepthLevel::from(&bs[i * 12..], segment).unwrap_or_default();
    }
    for i in 0..5 {
      depth.sell[i] = DepthLevel::from(&bs[60 + i * 12..], segment).unwrap_or_default();
    }
    Some(depth)
  }
}
