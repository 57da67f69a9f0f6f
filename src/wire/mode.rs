use serde_repr::{Deserialize_repr, Serialize_repr};

#[derive(
  Debug, Clone, Copy, Deserialize_repr, Serialize_repr, Default, PartialEq, Eq, PartialOrd, Ord,
  Hash,
)]
#[repr(u8)]
/// Subscription detail level. Ordered so `Full > Quote > LTP`, matching the
/// "effective mode is the maximum across callbacks" rule.
pub enum Mode {
  LTP = 1,
  #[default]
  Quote = 2,
  Full = 3,
}

impl Mode {
  pub fn to_wire_str(self) -> &'static str {
    match self {
      Mode::LTP => "ltp",
      Mode::Quote => "quote",
      Mode::Full => "full",
    }
  }
}
