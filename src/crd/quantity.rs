//! Resource quantities
//!
//! Claim requirements are expressed in Kubernetes quantity syntax
//! ("102400", "10Gi", "1.5T", "1e9"). Quantities are resolved to whole
//! units, rounding fractional values up. Values beyond the i128 range
//! saturate rather than fail, so a huge request stays a valid one.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 10^38 is the last power of ten that fits i128
const MAX_DECIMAL_EXPONENT: u32 = 38;

/// A Kubernetes-style resource quantity, kept in its textual form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Quantity(pub String);

impl Quantity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve to whole units (bytes for capacity)
    pub fn value(&self) -> Result<i128> {
        parse_quantity(&self.0)
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Quantity {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Quantity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unit multiplier attached to a quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scale {
    /// Power of two (Ki, Mi, ...)
    Binary(u32),
    /// Power of ten, possibly negative (k, M, m, exponent form)
    Decimal(i32),
}

/// Parse a quantity string into whole units
pub fn parse_quantity(input: &str) -> Result<i128> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::QuantityParse("empty quantity".into()));
    }

    let (negative, unsigned) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let num_end = unsigned
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(num_end);

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(Error::QuantityParse(format!("missing digits in {:?}", input)));
    }
    if frac_part.contains('.') {
        return Err(Error::QuantityParse(format!("malformed number in {:?}", input)));
    }

    let scale = parse_suffix(suffix)
        .ok_or_else(|| Error::QuantityParse(format!("unknown suffix {:?} in {:?}", suffix, input)))?;

    // Only digits remain, so a parse failure means the mantissa overflowed
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa: i128 = if digits.is_empty() {
        0
    } else {
        digits.parse().unwrap_or(i128::MAX)
    };
    let frac_digits = i32::try_from(frac_part.len()).unwrap_or(i32::MAX);

    let magnitude = match scale {
        Scale::Binary(shift) => {
            let scaled = mantissa.saturating_mul(1i128 << shift);
            scale_down(scaled, frac_digits.unsigned_abs())
        }
        Scale::Decimal(exp) => {
            let total = exp.saturating_sub(frac_digits);
            if total >= 0 {
                match pow10(total.unsigned_abs()) {
                    Some(factor) => mantissa.saturating_mul(factor),
                    None if mantissa == 0 => 0,
                    None => i128::MAX,
                }
            } else {
                scale_down(mantissa, total.unsigned_abs())
            }
        }
    };

    Ok(if negative { -magnitude } else { magnitude })
}

fn parse_suffix(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        other => return parse_exponent(other),
    };
    Some(scale)
}

/// Exponent form: e3, E-2, e+6
fn parse_exponent(suffix: &str) -> Option<Scale> {
    let rest = suffix.strip_prefix(['e', 'E'])?;
    let exp: i64 = rest.parse().ok()?;
    // Anything past +-10^38 saturates the same way
    let bound = i64::from(MAX_DECIMAL_EXPONENT) + 1;
    Some(Scale::Decimal(exp.clamp(-bound, bound) as i32))
}

fn pow10(exp: u32) -> Option<i128> {
    if exp > MAX_DECIMAL_EXPONENT {
        return None;
    }
    10i128.checked_pow(exp)
}

/// Divide by 10^exp, rounding up
fn scale_down(value: i128, exp: u32) -> i128 {
    match pow10(exp) {
        Some(divisor) => div_ceil(value, divisor),
        // Divisor larger than any i128: only zero stays zero
        None => i128::from(value > 0),
    }
}

fn div_ceil(value: i128, divisor: i128) -> i128 {
    let quotient = value / divisor;
    if value % divisor != 0 {
        quotient + 1
    } else {
        quotient
    }
}
