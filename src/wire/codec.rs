//! Frame Codec: parses the broker's big-endian length-prefixed
//! binary container into a sequence of [`Tick`]s, and renders outbound
//! JSON control frames for subscribe/mode/unsubscribe.

use super::parser::packet_length;
use super::request::batched;
use super::{Mode, Request, Tick};
use crate::error::{EngineError, Result};

/// Decode one inbound binary WebSocket frame into its ticks.
///
/// A frame shorter than two bytes is a heartbeat and decodes to an empty
/// sequence. Decoding is atomic per container: if any declared packet
/// length doesn't match a known layout, or the packets don't exactly
/// consume the container, the whole frame is rejected with
/// [`EngineError::MalformedFrame`] and none of its ticks are returned.
pub fn decode(frame: &[u8]) -> Result<Vec<Tick>> {
  if frame.len() < 2 {
    return Ok(Vec::new());
  }

  let num_packets = u16::from_be_bytes([frame[0], frame[1]]) as usize;
  let mut ticks = Vec::with_capacity(num_packets);
  let mut offset = 2usize;

  for _ in 0..num_packets {
    let Some(len_bytes) = frame.get(offset..offset + 2) else {
      return Err(EngineError::MalformedFrame {
        reason: format!("truncated length prefix at offset {offset}"),
      });
    };
    let packet_len = packet_length(len_bytes);
    let body_start = offset + 2;
    let body_end = body_start + packet_len;
    let Some(body) = frame.get(body_start..body_end) else {
      return Err(EngineError::MalformedFrame {
        reason: format!(
          "packet body [{body_start}..{body_end}) exceeds frame length {}",
          frame.len()
        ),
      });
    };

    let tick = Tick::try_from(body).map_err(|e| EngineError::MalformedFrame {
      reason: e.to_string(),
    })?;
    ticks.push(tick);
    offset = body_end;
  }

  if offset != frame.len() {
    return Err(EngineError::MalformedFrame {
      reason: format!("container declared {num_packets} packets but {offset} of {} bytes consumed", frame.len()),
    });
  }

  Ok(ticks)
}

/// Render the outbound JSON control frames needed to subscribe `tokens` at
/// `mode`, splitting into broker-sized batches. Each batch yields a
/// `subscribe` frame followed by a `mode` frame, mirroring the two-message
/// handshake the broker expects.
pub fn encode_subscribe(tokens: &[u32], mode: Mode) -> Vec<String> {
  let mut frames = Vec::new();
  for batch in batched(tokens) {
    frames.push(Request::subscribe(batch).to_string());
    frames.push(Request::mode(mode, batch).to_string());
  }
  frames
}

/// Render the outbound JSON control frames needed to unsubscribe `tokens`.
pub fn encode_unsubscribe(tokens: &[u32]) -> Vec<String> {
  batched(tokens).map(|batch| Request::unsubscribe(batch).to_string()).collect()
}
