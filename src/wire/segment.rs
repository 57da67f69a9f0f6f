use serde_repr::{Deserialize_repr, Serialize_repr};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
/// Exchange/market segment an instrument trades on, recovered from the low
/// byte of its native token. Determines the fixed-point price divisor.
pub enum Segment {
  #[default]
  NSE = 1,
  NFO = 2,
  CDS = 3,
  BSE = 4,
  BFO = 5,
  BCD = 6,
  MCX = 7,
  MCXSX = 8,
  INDICES = 9,
}

impl Segment {
  /// Fixed-point divisor for price fields: currency segments use 10000,
  /// every other segment (including indices) uses 100.
  pub fn divisor(&self) -> f64 {
    match self {
      Self::CDS | Self::BCD => 10_000.0,
      _ => 100.0,
    }
  }

  pub fn is_index(&self) -> bool {
    matches!(self, Self::INDICES)
  }
}

impl From<u32> for Segment {
  /// Recover the segment from a token's low byte, the broker's convention
  /// for encoding exchange prefix into the native key.
  fn from(token: u32) -> Self {
    match token & 0xFF {
      9 => Self::INDICES,
      8 => Self::MCXSX,
      7 => Self::MCX,
      6 => Self::BCD,
      5 => Self::BFO,
      4 => Self::BSE,
      3 => Self::CDS,
      2 => Self::NFO,
      _ => Self::NSE,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn currency_segments_use_wider_divisor() {
    assert_eq!(Segment::CDS.divisor(), 10_000.0);
    assert_eq!(Segment::BCD.divisor(), 10_000.0);
    assert_eq!(Segment::NSE.divisor(), 100.0);
    assert_eq!(Segment::INDICES.divisor(), 100.0);
  }

  #[test]
  fn only_indices_segment_is_non_tradable() {
    assert!(Segment::INDICES.is_index());
    assert!(!Segment::NSE.is_index());
  }
}
