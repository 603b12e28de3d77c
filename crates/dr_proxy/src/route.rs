use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Comparison applied between the extracted payload window and the route
/// literal. The serde names are the config-file operator symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RouteOp {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!==")]
    NotEqual,
    #[serde(rename = "|=")]
    OrThenEqual,
    #[serde(rename = "!|=")]
    OrThenNotEqual,
    #[serde(rename = "&=")]
    AndThenEqual,
    #[serde(rename = "!&=")]
    AndThenNotEqual,
}

/// Declarative payload matcher: compares `payload[start..end]` against a
/// pre-decoded literal and names the target upstream. Immutable after load,
/// evaluated in declaration order.
#[derive(Debug, Clone)]
pub struct Route {
    id: usize,
    start: usize,
    end: usize,
    op: RouteOp,
    value: Vec<u8>,
    upstream: String,
}

impl Route {
    pub fn new(
        id: usize,
        key_bytes: &str,
        op: RouteOp,
        value: &str,
        upstream: &str,
    ) -> Result<Self> {
        let (start, end) = parse_byte_range(key_bytes)
            .with_context(|| format!("route {id} has invalid key range {key_bytes:?}"))?;
        let value = decode_literal(value)
            .with_context(|| format!("route {id} has invalid literal {value:?}"))?;
        if value.len() != end - start {
            bail!(
                "route {id} literal is {} bytes but key range {key_bytes:?} selects {}",
                value.len(),
                end - start
            );
        }

        Ok(Self {
            id,
            start,
            end,
            op,
            value,
            upstream: upstream.to_string(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// A payload shorter than the key range is a non-match, not an error.
    pub fn matches(&self, payload: &[u8]) -> bool {
        if payload.len() < self.end {
            return false;
        }
        eval_op(self.op, &payload[self.start..self.end], &self.value)
    }
}

fn eval_op(op: RouteOp, extracted: &[u8], literal: &[u8]) -> bool {
    match op {
        RouteOp::Equal => extracted == literal,
        RouteOp::NotEqual => extracted != literal,
        RouteOp::OrThenEqual => or_then_equal(extracted, literal),
        RouteOp::OrThenNotEqual => !or_then_equal(extracted, literal),
        RouteOp::AndThenEqual => and_then_equal(extracted, literal),
        RouteOp::AndThenNotEqual => !and_then_equal(extracted, literal),
    }
}

// (l | r) == r: every 1-bit of l is also set in r.
fn or_then_equal(left: &[u8], right: &[u8]) -> bool {
    left.iter().zip(right).all(|(l, r)| (l | r) == *r)
}

// (l & r) == r: every 1-bit of r is also set in l.
fn and_then_equal(left: &[u8], right: &[u8]) -> bool {
    left.iter().zip(right).all(|(l, r)| (l & r) == *r)
}

/// Parse a `"start:end"` byte range; `start < end` is required.
pub fn parse_byte_range(raw: &str) -> Result<(usize, usize)> {
    let Some((start, end)) = raw.split_once(':') else {
        bail!("byte range {raw:?} is not of the form start:end");
    };
    let start: usize = start
        .trim()
        .parse()
        .with_context(|| format!("invalid range start in {raw:?}"))?;
    let end: usize = end
        .trim()
        .parse()
        .with_context(|| format!("invalid range end in {raw:?}"))?;
    if start >= end {
        bail!("byte range {raw:?} is empty or reversed");
    }
    Ok((start, end))
}

/// Decode a `0x` hex string or `0b` bit string into bytes.
pub fn decode_literal(value: &str) -> Result<Vec<u8>> {
    match value.as_bytes() {
        [b'0', b'x', rest @ ..] => decode_hex(rest),
        [b'0', b'b', rest @ ..] => decode_bits(rest),
        _ => bail!("literal {value:?} must start with 0x or 0b"),
    }
}

fn decode_hex(digits: &[u8]) -> Result<Vec<u8>> {
    if digits.is_empty() || digits.len() % 2 != 0 {
        bail!("hex literal has invalid length {}", digits.len());
    }

    digits
        .chunks_exact(2)
        .map(|pair| {
            let high = hex_value(pair[0])?;
            let low = hex_value(pair[1])?;
            Ok((high << 4) | low)
        })
        .collect()
}

fn hex_value(digit: u8) -> Result<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => bail!("invalid hex digit {:?}", digit as char),
    }
}

fn decode_bits(digits: &[u8]) -> Result<Vec<u8>> {
    if digits.is_empty() || digits.len() % 8 != 0 {
        bail!("bit literal has invalid length {}", digits.len());
    }

    digits
        .chunks_exact(8)
        .map(|byte_bits| {
            byte_bits.iter().try_fold(0u8, |acc, bit| match bit {
                b'0' => Ok(acc << 1),
                b'1' => Ok((acc << 1) | 1),
                _ => bail!("invalid bit digit {:?}", *bit as char),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(op: RouteOp, key_bytes: &str, value: &str) -> Route {
        Route::new(0, key_bytes, op, value, "pool").expect("valid route")
    }

    #[test]
    fn equal_matches_identical_window() {
        let route = route(RouteOp::Equal, "0:3", "0x7118FF");
        assert!(route.matches(&[0x71, 0x18, 0xFF]));
        assert!(route.matches(&[0x71, 0x18, 0xFF, 0xAA]));
        assert!(!route.matches(&[0x71, 0x18, 0xFE]));
    }

    #[test]
    fn short_payload_is_a_non_match() {
        let route = route(RouteOp::Equal, "0:3", "0x7118FF");
        assert!(!route.matches(&[0x71, 0x18]));
        assert!(!route.matches(&[]));
    }

    #[test]
    fn or_then_equal_requires_extracted_bits_within_literal() {
        let route = route(RouteOp::OrThenEqual, "0:2", "0xFF44");
        assert!(route.matches(&[0x00, 0x44]));
        assert!(!route.matches(&[0x00, 0x45]));

        let negated = Route::new(1, "0:2", RouteOp::OrThenNotEqual, "0xFF44", "pool")
            .expect("valid route");
        assert!(!negated.matches(&[0x00, 0x44]));
        assert!(negated.matches(&[0x00, 0x45]));
    }

    #[test]
    fn and_then_equal_requires_literal_bits_present() {
        let route = route(RouteOp::AndThenEqual, "0:2", "0x000C");
        assert!(route.matches(&[0x22, 0xFC]));
        assert!(!route.matches(&[0x22, 0xF0]));
    }

    #[test]
    fn offset_window_is_extracted() {
        let route = route(RouteOp::Equal, "2:4", "0xBEEF");
        assert!(route.matches(&[0x00, 0x00, 0xBE, 0xEF]));
        assert!(!route.matches(&[0xBE, 0xEF, 0x00, 0x00]));
    }

    #[test]
    fn bit_literals_decode_like_hex() {
        assert_eq!(
            decode_literal("0b0111000100011000").expect("bit literal"),
            decode_literal("0x7118").expect("hex literal"),
        );
    }

    #[test]
    fn malformed_literals_are_rejected() {
        assert!(decode_literal("7118").is_err());
        assert!(decode_literal("0x711").is_err());
        assert!(decode_literal("0x71GX").is_err());
        assert!(decode_literal("0b0101").is_err());
        assert!(decode_literal("0b01010102").is_err());
    }

    #[test]
    fn literal_length_must_cover_key_range() {
        let err = Route::new(0, "0:3", RouteOp::Equal, "0x7118", "pool")
            .expect_err("length mismatch should fail");
        assert!(err.to_string().contains("2 bytes"), "unexpected: {err}");
    }

    #[test]
    fn byte_ranges_are_validated() {
        assert!(parse_byte_range("0:4").is_ok());
        assert!(parse_byte_range("4:4").is_err());
        assert!(parse_byte_range("5:2").is_err());
        assert!(parse_byte_range("x:2").is_err());
        assert!(parse_byte_range("3").is_err());
    }
}
