//! Synthetic straddle composite symbol naming: `<UNDERLYING><YY><MON><STRIKE>_STRDL`.

const MONTHS: [&str; 12] =
  ["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"];

#[derive(Debug, Clone, PartialEq)]
pub struct StraddleKey {
  pub underlying: String,
  pub year_2d: u8,
  pub month: String,
  pub strike: f64,
}

fn format_strike(strike: f64) -> String {
  if strike.fract() == 0.0 {
    format!("{}", strike as i64)
  } else {
    format!("{strike}")
  }
}

pub fn format_straddle(underlying: &str, year_2d: u8, month_index: u32, strike: f64) -> String {
  let month = MONTHS[(month_index.saturating_sub(1) % 12) as usize];
  format!("{underlying}{year_2d:02}{month}{}_STRDL", format_strike(strike))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
  Call,
  Put,
}

/// Exchange-style option leg symbol, e.g. `NIFTY25DEC24000CE`.
pub fn format_leg(underlying: &str, year_2d: u8, month_index: u32, strike: f64, kind: OptionKind) -> String {
  let month = MONTHS[(month_index.saturating_sub(1) % 12) as usize];
  let suffix = match kind {
    OptionKind::Call => "CE",
    OptionKind::Put => "PE",
  };
  format!("{underlying}{year_2d:02}{month}{}{suffix}", format_strike(strike))
}

/// Recover the components of a composite symbol produced by [`format_straddle`].
pub fn parse_straddle(symbol: &str) -> Option<StraddleKey> {
  let body = symbol.strip_suffix("_STRDL")?;

  let digit_start = body.rfind(|c: char| !c.is_ascii_digit() && c != '.')? + 1;
  if digit_start >= body.len() {
    return None;
  }
  let strike: f64 = body[digit_start..].parse().ok()?;
  let rest = &body[..digit_start];

  if rest.len() < 5 {
    return None;
  }
  let month = &rest[rest.len() - 3..];
  if !MONTHS.contains(&month) {
    return None;
  }
  let year_part = &rest[rest.len() - 5..rest.len() - 3];
  let year_2d: u8 = year_part.parse().ok()?;
  let underlying = &rest[..rest.len() - 5];
  if underlying.is_empty() {
    return None;
  }

  Some(StraddleKey { underlying: underlying.to_string(), year_2d, month: month.to_string(), strike })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn formats_the_documented_example() {
    assert_eq!(format_straddle("NIFTY", 25, 12, 24000.0), "NIFTY25DEC24000_STRDL");
  }

  #[test]
  fn round_trips_through_parse() {
    let symbol = format_straddle("BANKNIFTY", 26, 1, 51500.0);
    let parsed = parse_straddle(&symbol).unwrap();
    assert_eq!(parsed.underlying, "BANKNIFTY");
    assert_eq!(parsed.year_2d, 26);
    assert_eq!(parsed.month, "JAN");
    assert_eq!(parsed.strike, 51500.0);
  }

  #[test]
  fn rejects_non_straddle_symbols() {
    assert!(parse_straddle("NIFTY25DEC24000CE").is_none());
    assert!(parse_straddle("RELIANCE").is_none());
  }
}
