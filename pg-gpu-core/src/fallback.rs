//! Rows the device deferred, and an exact CPU decoder for them.
//!
//! [`ReferenceNumeric`] keeps a `numeric` as its decimal digit string, so it
//! handles any digit count, NaN and the infinities. It is the fallback path
//! for deferred rows and the reference the device decode is checked against.

use bytes::Bytes;
use gpu_decode_kernels::wire::{
    NumericHeader, DEC_DIGITS, NBASE, NUMERIC_NAN, NUMERIC_NEG, NUMERIC_NINF, NUMERIC_PINF,
    NUMERIC_POS,
};
use gpu_decode_kernels::{DeferReason, FaultKind, RoundingMode};
use std::fmt;
use std::str::FromStr;

/// A value the device left for the CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRow {
    pub column: usize,
    /// Row index within the decoded batch.
    pub row: usize,
    /// The field bytes as they arrived, without the length prefix.
    pub raw: Bytes,
    pub reason: DeferReason,
}

impl FallbackRow {
    pub fn decode(&self) -> Result<ReferenceNumeric, FaultKind> {
        ReferenceNumeric::from_wire(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceNumeric {
    NaN,
    PositiveInfinity,
    NegativeInfinity,
    /// `digits * 10^exponent`, shown with `dscale` fractional digits.
    Finite {
        negative: bool,
        digits: String,
        exponent: i32,
        dscale: u16,
    },
}

impl ReferenceNumeric {
    pub fn from_wire(field: &[u8]) -> Result<Self, FaultKind> {
        let malformed = || FaultKind::NumericLength { length: field.len() };
        let header = NumericHeader::parse(field).ok_or_else(malformed)?;
        if header.expected_len() != Some(field.len()) {
            return Err(malformed());
        }
        let negative = match header.sign {
            NUMERIC_POS => false,
            NUMERIC_NEG => true,
            NUMERIC_NAN => return Ok(Self::NaN),
            NUMERIC_PINF => return Ok(Self::PositiveInfinity),
            NUMERIC_NINF => return Ok(Self::NegativeInfinity),
            other => return Err(FaultKind::NumericSign(other)),
        };

        let mut digits = String::with_capacity(4 * header.ndigits as usize);
        for i in 0..header.ndigits as usize {
            let group = NumericHeader::digit(field, i).ok_or_else(malformed)?;
            if group as u32 >= NBASE {
                return Err(FaultKind::NumericDigit(group));
            }
            digits.push_str(&format!("{:04}", group));
        }
        Ok(Self::finite(
            negative,
            digits,
            DEC_DIGITS * (header.weight as i32 - header.ndigits as i32 + 1),
            header.dscale.max(0) as u16,
        ))
    }

    fn finite(negative: bool, digits: String, exponent: i32, dscale: u16) -> Self {
        let digits = digits.trim_start_matches('0').to_string();
        Self::Finite {
            negative: negative && !digits.is_empty(),
            digits,
            exponent,
            dscale,
        }
    }

    /// Unscaled integer at `scale`, or `None` for NaN, infinities and values
    /// beyond `i128`.
    pub fn to_unscaled(&self, scale: i8, rounding: RoundingMode) -> Option<i128> {
        let Self::Finite {
            negative,
            digits,
            exponent,
            ..
        } = self
        else {
            return None;
        };

        let shift = *exponent + scale as i32;
        let (kept, next_digit) = if shift >= 0 {
            (format!("{}{}", digits, "0".repeat(shift as usize)), 0)
        } else {
            let dropped = shift.unsigned_abs() as usize;
            if dropped > digits.len() {
                (String::new(), 0)
            } else {
                let cut = digits.len() - dropped;
                let next = digits.as_bytes().get(cut).map_or(0, |b| b - b'0');
                (digits[..cut].to_string(), next)
            }
        };

        let mut magnitude = kept.bytes().try_fold(0i128, |acc, b| {
            acc.checked_mul(10)?.checked_add((b - b'0') as i128)
        })?;
        if rounding == RoundingMode::HalfAwayFromZero && next_digit >= 5 {
            magnitude = magnitude.checked_add(1)?;
        }
        Some(if *negative { -magnitude } else { magnitude })
    }

    /// Wire bytes of this value, with digit groups normalized.
    pub fn to_wire(&self) -> Vec<u8> {
        let (sign, groups, weight, dscale) = match self {
            Self::NaN => (NUMERIC_NAN, Vec::new(), 0, 0),
            Self::PositiveInfinity => (NUMERIC_PINF, Vec::new(), 0, 0),
            Self::NegativeInfinity => (NUMERIC_NINF, Vec::new(), 0, 0),
            Self::Finite {
                negative,
                digits,
                exponent,
                dscale,
            } => {
                // Align the exponent to a group boundary, then pad on the left.
                let pad_right = exponent.rem_euclid(DEC_DIGITS);
                let exponent = exponent - pad_right;
                let mut aligned = format!("{}{}", digits, "0".repeat(pad_right as usize));
                let pad_left = (4 - aligned.len() % 4) % 4;
                aligned.insert_str(0, &"0".repeat(pad_left));

                let mut groups: Vec<u16> = aligned
                    .as_bytes()
                    .chunks(4)
                    .map(|c| c.iter().fold(0u16, |acc, b| acc * 10 + (b - b'0') as u16))
                    .collect();
                let mut weight = exponent / DEC_DIGITS + groups.len() as i32 - 1;
                while groups.first() == Some(&0) {
                    groups.remove(0);
                    weight -= 1;
                }
                while groups.last() == Some(&0) {
                    groups.pop();
                }
                if groups.is_empty() {
                    weight = 0;
                }
                let sign = if *negative { NUMERIC_NEG } else { NUMERIC_POS };
                (sign, groups, weight, *dscale)
            }
        };

        let mut out = Vec::with_capacity(8 + 2 * groups.len());
        out.extend_from_slice(&(groups.len() as i16).to_be_bytes());
        out.extend_from_slice(&(weight as i16).to_be_bytes());
        out.extend_from_slice(&sign.to_be_bytes());
        out.extend_from_slice(&(dscale as i16).to_be_bytes());
        for g in groups {
            out.extend_from_slice(&g.to_be_bytes());
        }
        out
    }
}

/// PostgreSQL text form: `dscale` fractional digits, `NaN`, `Infinity`.
impl fmt::Display for ReferenceNumeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (negative, digits, exponent, dscale) = match self {
            Self::NaN => return f.write_str("NaN"),
            Self::PositiveInfinity => return f.write_str("Infinity"),
            Self::NegativeInfinity => return f.write_str("-Infinity"),
            Self::Finite {
                negative,
                digits,
                exponent,
                dscale,
            } => (*negative, digits, *exponent, *dscale as usize),
        };

        let (int, mut frac) = if exponent >= 0 {
            (format!("{}{}", digits, "0".repeat(exponent as usize)), String::new())
        } else {
            let k = exponent.unsigned_abs() as usize;
            if digits.len() > k {
                let cut = digits.len() - k;
                (digits[..cut].to_string(), digits[cut..].to_string())
            } else {
                (String::new(), format!("{}{}", "0".repeat(k - digits.len()), digits))
            }
        };
        if frac.len() > dscale {
            frac.truncate(dscale);
        } else {
            frac.push_str(&"0".repeat(dscale - frac.len()));
        }

        if negative {
            f.write_str("-")?;
        }
        let int = int.trim_start_matches('0');
        f.write_str(if int.is_empty() { "0" } else { int })?;
        if dscale > 0 {
            write!(f, ".{}", frac)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseNumericError(String);

impl fmt::Display for ParseNumericError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid numeric literal '{}'", self.0)
    }
}

impl std::error::Error for ParseNumericError {}

/// Parses plain decimal literals (`-12.50`), `NaN`, `Infinity` and
/// `-Infinity`. Exponent notation is not accepted.
impl FromStr for ReferenceNumeric {
    type Err = ParseNumericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NaN" => return Ok(Self::NaN),
            "Infinity" => return Ok(Self::PositiveInfinity),
            "-Infinity" => return Ok(Self::NegativeInfinity),
            _ => {}
        }
        let err = || ParseNumericError(s.to_string());
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let dscale = u16::try_from(frac.len()).map_err(|_| err())?;
        Ok(Self::finite(
            negative,
            format!("{}{}", int, frac),
            -(frac.len() as i32),
            dscale,
        ))
    }
}
