use serde::Serialize;
use std::fmt;

use super::Mode;

/// Kite-style broker control-frame cap: larger token sets are split client-side.
pub const MAX_TOKENS_PER_FRAME: usize = 3000;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Action {
  Subscribe,
  Unsubscribe,
  Mode,
}

#[derive(Clone, Debug)]
enum Payload {
  Tokens(Vec<u32>),
  TokensWithMode(Mode, Vec<u32>),
}

impl Serialize for Payload {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    match self {
      Payload::Tokens(tokens) => tokens.serialize(serializer),
      Payload::TokensWithMode(mode, tokens) => (mode.to_wire_str(), tokens).serialize(serializer),
    }
  }
}

#[derive(Clone, Debug, Serialize)]
/// A single outbound JSON control message.
pub struct Request {
  a: Action,
  v: Payload,
}

impl Request {
  pub fn subscribe(tokens: &[u32]) -> Request {
    Request {
      a: Action::Subscribe,
      v: Payload::Tokens(tokens.to_vec()),
    }
  }

  pub fn unsubscribe(tokens: &[u32]) -> Request {
    Request {
      a: Action::Unsubscribe,
      v: Payload::Tokens(tokens.to_vec()),
    }
  }

  pub fn mode(mode: Mode, tokens: &[u32]) -> Request {
    Request {
      a: Action::Mode,
      v: Payload::TokensWithMode(mode, tokens.to_vec()),
    }
  }
}

impl fmt::Display for Request {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let json = serde_json::to_string(self).expect("Request always serializes");
    write!(f, "{json}")
  }
}

/// Split a token batch into frames no larger than the broker cap, preserving order.
pub fn batched(tokens: &[u32]) -> impl Iterator<Item = &[u32]> {
  tokens.chunks(MAX_TOKENS_PER_FRAME)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn subscribe_serializes_as_flat_token_array() {
    let req = Request::subscribe(&[1, 2, 3]);
    assert_eq!(req.to_string(), r#"{"a":"subscribe","v":[1,2,3]}"#);
  }

  #[test]
  fn mode_serializes_as_tuple_of_mode_and_tokens() {
    let req = Request::mode(Mode::Full, &[256265]);
    assert_eq!(req.to_string(), r#"{"a":"mode","v":["full",[256265]]}"#);
  }

  #[test]
  fn batches_respect_broker_cap() {
    let tokens: Vec<u32> = (0..7000).collect();
    let batches: Vec<_> = batched(&tokens).collect();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].len(), MAX_TOKENS_PER_FRAME);
    assert_eq!(batches[2].len(), 1000);
  }
}
