//! IEEE 754-2008 decimal128 values in the binary integer (BID) encoding.
//!
//! The wire carries the 16 bytes verbatim; this module additionally converts
//! to and from the scientific string form so the JSON mapping can render
//! `$numberDecimal` values. Only exactly representable strings are accepted.

use std::fmt;

use crate::error::{Error, Result};

const EXPONENT_BIAS: i32 = 6176;
const EXPONENT_MIN: i32 = -6176;
const EXPONENT_MAX: i32 = 6111;
const MAX_COEFFICIENT: u128 = 10u128.pow(34) - 1;

/// A decimal128 value, stored exactly as the 16 little-endian wire bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Decimal128 {
    bytes: [u8; 16],
}

impl Decimal128 {
    pub fn from_bytes(bytes: [u8; 16]) -> Decimal128 {
        Decimal128 { bytes }
    }

    pub fn bytes(&self) -> [u8; 16] {
        self.bytes
    }

    fn from_bits(high: u64, low: u64) -> Decimal128 {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&low.to_le_bytes());
        bytes[8..16].copy_from_slice(&high.to_le_bytes());
        Decimal128 { bytes }
    }

    fn bits(&self) -> (u64, u64) {
        let low = u64::from_le_bytes(self.bytes[0..8].try_into().unwrap());
        let high = u64::from_le_bytes(self.bytes[8..16].try_into().unwrap());
        (high, low)
    }

    pub fn zero() -> Decimal128 {
        Decimal128::from_bits((EXPONENT_BIAS as u64) << 49, 0)
    }

    /// Parse the scientific string form, e.g. `"0.1"`, `"-2.5E+7"`, `"NaN"`.
    pub fn parse_str(s: &str) -> Result<Decimal128> {
        let bad = || Error::MalformedDocument(format!("invalid decimal128 literal: {:?}", s));

        let (negative, rest) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let sign_bit = if negative { 1u64 << 63 } else { 0 };

        if rest.eq_ignore_ascii_case("infinity") || rest.eq_ignore_ascii_case("inf") {
            return Ok(Decimal128::from_bits(sign_bit | 0x7800_0000_0000_0000, 0));
        }
        if rest.eq_ignore_ascii_case("nan") {
            return Ok(Decimal128::from_bits(0x7C00_0000_0000_0000, 0));
        }

        // Split off the exponent part.
        let (mantissa, mut exponent) = match rest.find(['e', 'E']) {
            Some(idx) => {
                let exp: i32 = rest[idx + 1..].parse().map_err(|_| bad())?;
                (&rest[..idx], exp)
            }
            None => (rest, 0),
        };

        let mut coefficient: u128 = 0;
        let mut digits = 0usize;
        let mut seen_point = false;
        if mantissa.is_empty() {
            return Err(bad());
        }
        for c in mantissa.chars() {
            match c {
                '.' if !seen_point => seen_point = true,
                '0'..='9' => {
                    // Leading zeros carry no significance.
                    if coefficient == 0 && c == '0' {
                        if seen_point {
                            exponent -= 1;
                        }
                        continue;
                    }
                    if digits >= 34 {
                        // Trailing zeros past the precision limit are absorbed
                        // into the exponent; anything else is inexact.
                        if c == '0' && !seen_point {
                            exponent += 1;
                            continue;
                        }
                        return Err(bad());
                    }
                    coefficient = coefficient * 10 + (c as u128 - '0' as u128);
                    digits += 1;
                    if seen_point {
                        exponent -= 1;
                    }
                }
                _ => return Err(bad()),
            }
        }

        // Pad with zeros when the exponent overshoots the representable range.
        while exponent > EXPONENT_MAX && coefficient <= MAX_COEFFICIENT / 10 {
            coefficient *= 10;
            exponent -= 1;
        }
        if !(EXPONENT_MIN..=EXPONENT_MAX).contains(&exponent) || coefficient > MAX_COEFFICIENT {
            return Err(bad());
        }

        let biased = (exponent + EXPONENT_BIAS) as u64;
        let high = sign_bit | (biased << 49) | ((coefficient >> 64) as u64);
        let low = coefficient as u64;
        Ok(Decimal128::from_bits(high, low))
    }
}

impl fmt::Display for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (high, low) = self.bits();
        let combination = (high >> 58) & 0b11111;
        if combination == 0b11111 {
            // NaN carries no sign in the string form.
            return write!(f, "NaN");
        }
        if high & (1 << 63) != 0 {
            write!(f, "-")?;
        }
        if combination == 0b11110 {
            return write!(f, "Infinity");
        }

        let (biased, coefficient) = if (high >> 61) & 0b11 == 0b11 {
            // Coefficients with the implied 0b100 prefix exceed 10^34-1 and
            // are non-canonical; IEEE reads them as zero.
            (((high >> 47) & 0x3FFF) as i32, 0u128)
        } else {
            let coeff = (((high & 0x0001_FFFF_FFFF_FFFF) as u128) << 64) | low as u128;
            let coeff = if coeff > MAX_COEFFICIENT { 0 } else { coeff };
            (((high >> 49) & 0x3FFF) as i32, coeff)
        };
        let exponent = biased - EXPONENT_BIAS;

        let digits = coefficient.to_string();
        let adjusted = exponent + digits.len() as i32 - 1;

        if exponent <= 0 && adjusted >= -6 {
            // Plain notation.
            if exponent == 0 {
                write!(f, "{}", digits)
            } else if digits.len() as i32 > -exponent {
                let point = (digits.len() as i32 + exponent) as usize;
                write!(f, "{}.{}", &digits[..point], &digits[point..])
            } else {
                let zeros = (-exponent) as usize - digits.len();
                write!(f, "0.{}{}", "0".repeat(zeros), digits)
            }
        } else {
            // Scientific notation.
            if digits.len() > 1 {
                write!(f, "{}.{}", &digits[..1], &digits[1..])?;
            } else {
                write!(f, "{}", digits)?;
            }
            if adjusted < 0 {
                write!(f, "E{}", adjusted)
            } else {
                write!(f, "E+{}", adjusted)
            }
        }
    }
}

impl fmt::Debug for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal128({})", self)
    }
}
