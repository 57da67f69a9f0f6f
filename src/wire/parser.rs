use byteorder::{BigEndian, ByteOrder};

use super::Segment;

pub(crate) fn value(input: &[u8]) -> Option<u32> {
  (input.len() >= 4).then(|| BigEndian::read_u32(input))
}

pub(crate) fn value_short(input: &[u8]) -> Option<u16> {
  (input.len() >= 2).then(|| BigEndian::read_u16(input))
}

pub(crate) fn signed(input: &[u8]) -> Option<i32> {
  (input.len() >= 4).then(|| BigEndian::read_i32(input))
}

pub(crate) fn price(input: &[u8], segment: Segment) -> Option<f64> {
  signed(input).map(|raw| raw as f64 / segment.divisor())
}

/// Read the big-endian u16 packet-length prefix of a framed body.
pub(crate) fn packet_length(bs: &[u8]) -> usize {
  if bs.len() >= 2 {
    BigEndian::read_u16(bs) as usize
  } else {
    0
  }
}
