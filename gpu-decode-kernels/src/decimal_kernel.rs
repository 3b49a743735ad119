//! Pass-2 for `numeric` columns: base-10000 digit groups to Decimal128.
//!
//! Each row is folded into a [`WideInt`], aligned to the column scale and
//! written as 16 little-endian bytes. Rows the device cannot represent
//! (NaN, infinities, too many digit groups, magnitude above the declared
//! precision) get a zero slot and a bit in the overflow mask; the CPU decodes
//! them from the raw field bytes.

use arrow_interop::{AtomicBitmap, OverflowMask};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::launch::{Device, FaultKind, FaultSlot, KernelFault};
use crate::scan_kernel::FieldTable;
use crate::wide::WideInt;
use crate::wire::{
    NumericHeader, DEC_DIGITS, MAX_DEVICE_GROUPS, NBASE, NUMERIC_NAN, NUMERIC_NEG,
    NUMERIC_NINF, NUMERIC_PINF, NUMERIC_POS,
};

/// Bytes of one Decimal128 slot.
pub const DECIMAL_WIDTH: usize = 16;

/// What happens to digits beyond the target scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Drop them.
    #[default]
    Truncate,
    /// Round half away from zero.
    HalfAwayFromZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalTarget {
    pub precision: u8,
    pub scale: i8,
    pub rounding: RoundingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// More digit groups than the device folds.
    DigitBound,
    NaN,
    Infinity,
    /// The scaled value does not fit the declared precision.
    Overflow,
}

/// Per-row result of the numeric decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOutcome {
    Null,
    Decoded(i128),
    Deferred(DeferReason),
}

/// Decode one field. Only malformed input is an error.
pub fn decode_numeric(
    field: Option<&[u8]>,
    target: &DecimalTarget,
) -> Result<NumericOutcome, FaultKind> {
    let Some(field) = field else {
        return Ok(NumericOutcome::Null);
    };
    let malformed = || FaultKind::NumericLength { length: field.len() };
    let header = NumericHeader::parse(field).ok_or_else(malformed)?;
    if header.expected_len() != Some(field.len()) {
        return Err(malformed());
    }
    let ndigits = header.ndigits as usize;
    for i in 0..ndigits {
        let digit = NumericHeader::digit(field, i).ok_or_else(malformed)?;
        if digit as u32 >= NBASE {
            return Err(FaultKind::NumericDigit(digit));
        }
    }

    let negative = match header.sign {
        NUMERIC_POS => false,
        NUMERIC_NEG => true,
        NUMERIC_NAN => return Ok(NumericOutcome::Deferred(DeferReason::NaN)),
        NUMERIC_PINF | NUMERIC_NINF => return Ok(NumericOutcome::Deferred(DeferReason::Infinity)),
        other => return Err(FaultKind::NumericSign(other)),
    };
    if ndigits > MAX_DEVICE_GROUPS {
        return Ok(NumericOutcome::Deferred(DeferReason::DigitBound));
    }

    // Nine groups are at most 36 digits, so the fold cannot overflow.
    let mut value = WideInt::ZERO;
    for i in 0..ndigits {
        let digit = NumericHeader::digit(field, i).unwrap_or(0);
        value = match value.checked_mul_add_small(NBASE, digit as u32) {
            Some(v) => v,
            None => return Ok(NumericOutcome::Deferred(DeferReason::Overflow)),
        };
    }

    let exponent =
        DEC_DIGITS * (header.weight as i32 - header.ndigits as i32 + 1) + target.scale as i32;
    let magnitude = match align(value, exponent, target.rounding) {
        Some(v) => v,
        None => return Ok(NumericOutcome::Deferred(DeferReason::Overflow)),
    };
    let limit = WideInt::pow10(target.precision as u32).unwrap_or(WideInt {
        hi: u64::MAX,
        lo: u64::MAX,
    });
    if magnitude >= limit {
        return Ok(NumericOutcome::Deferred(DeferReason::Overflow));
    }

    let signed = if negative { magnitude.wrapping_neg() } else { magnitude };
    Ok(NumericOutcome::Decoded(i128::from_le_bytes(signed.to_le_bytes())))
}

/// Scale `value` by `10^exponent`. `None` when the product overflows.
fn align(value: WideInt, exponent: i32, rounding: RoundingMode) -> Option<WideInt> {
    if exponent >= 0 {
        return value.checked_mul_pow10(exponent as u32);
    }
    let shift = exponent.unsigned_abs();
    // 10^39 exceeds every 128-bit value: the quotient and the rounding digit
    // are both zero.
    if shift > 39 {
        return Some(WideInt::ZERO);
    }
    let (quotient, digit) = value.div_pow10(shift - 1).div_rem_small(10);
    match rounding {
        RoundingMode::HalfAwayFromZero if digit >= 5 => quotient.checked_mul_add_small(1, 1),
        _ => Some(quotient),
    }
}

pub struct DecimalScatterParams<'a> {
    pub bytes: &'a [u8],
    pub fields: &'a FieldTable,
    pub column: usize,
    pub target: DecimalTarget,
}

pub struct DecimalKernel {
    device: Arc<Device>,
}

impl DecimalKernel {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// One thread per row writes a 16-byte slot of `dest` and flags deferred
    /// rows in the returned mask.
    pub fn scatter(
        &self,
        params: DecimalScatterParams<'_>,
        dest: &mut [u8],
    ) -> Result<OverflowMask, KernelFault> {
        let started = Instant::now();
        let rows = params.fields.rows();
        debug_assert_eq!(dest.len(), rows * DECIMAL_WIDTH);
        let overflow = AtomicBitmap::new(rows);
        let deferred = AtomicUsize::new(0);
        let faults = FaultSlot::new();

        self.device.launch_slots(dest, DECIMAL_WIDTH, |row, slot| {
            let field = params.fields.get(row, params.column);
            let data = (!field.is_null()).then(|| &params.bytes[field.range()]);
            match decode_numeric(data, &params.target) {
                Ok(NumericOutcome::Decoded(v)) => slot.copy_from_slice(&v.to_le_bytes()),
                Ok(NumericOutcome::Null) => slot.fill(0),
                Ok(NumericOutcome::Deferred(_)) => {
                    slot.fill(0);
                    overflow.set(row);
                    deferred.fetch_add(1, Ordering::Relaxed);
                }
                Err(kind) => {
                    slot.fill(0);
                    faults.record(KernelFault {
                        row,
                        column: params.column,
                        kind,
                    });
                }
            }
        });
        faults.into_result()?;

        debug!(
            "Decoded numeric column {} as Decimal128({}, {}): {} rows, {} deferred, {:?}",
            params.column,
            params.target.precision,
            params.target.scale,
            rows,
            deferred.into_inner(),
            started.elapsed()
        );
        Ok(overflow.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_kernel::{ScanKernel, ScanParams};
    use crate::test_util::{encode_numeric, encode_rows, numeric_bytes, test_device};

    const P38_S6: DecimalTarget = DecimalTarget {
        precision: 38,
        scale: 6,
        rounding: RoundingMode::Truncate,
    };

    fn decode(text: &str, target: &DecimalTarget) -> NumericOutcome {
        decode_numeric(Some(&encode_numeric(text)[..]), target).unwrap()
    }

    #[test]
    fn test_decodes_at_scale_six() {
        assert_eq!(decode("0", &P38_S6), NumericOutcome::Decoded(0));
        assert_eq!(decode("123.456", &P38_S6), NumericOutcome::Decoded(123_456_000));
        assert_eq!(
            decode("-987654321.123456", &P38_S6),
            NumericOutcome::Decoded(-987_654_321_123_456)
        );
        assert_eq!(decode("0.001", &P38_S6), NumericOutcome::Decoded(1_000));
        assert_eq!(
            decode("999999999999999999.999999", &P38_S6),
            NumericOutcome::Decoded(999_999_999_999_999_999_999_999)
        );
        assert_eq!(decode("10000", &P38_S6), NumericOutcome::Decoded(10_000_000_000));
    }

    #[test]
    fn test_null_is_not_deferred() {
        assert_eq!(decode_numeric(None, &P38_S6), Ok(NumericOutcome::Null));
    }

    #[test]
    fn test_special_values_are_deferred() {
        let nan = numeric_bytes(&[], 0, NUMERIC_NAN, 0);
        let inf = numeric_bytes(&[], 0, NUMERIC_PINF, 0);
        assert_eq!(
            decode_numeric(Some(&nan[..]), &P38_S6),
            Ok(NumericOutcome::Deferred(DeferReason::NaN))
        );
        assert_eq!(
            decode_numeric(Some(&inf[..]), &P38_S6),
            Ok(NumericOutcome::Deferred(DeferReason::Infinity))
        );
        // 40 digits: ten groups.
        let long = "1234567890123456789012345678901234567890";
        assert_eq!(decode(long, &P38_S6), NumericOutcome::Deferred(DeferReason::DigitBound));
    }

    #[test]
    fn test_precision_overflow_is_deferred() {
        let target = DecimalTarget { precision: 5, scale: 2, rounding: RoundingMode::Truncate };
        assert_eq!(decode("999.99", &target), NumericOutcome::Decoded(99_999));
        assert_eq!(decode("1000", &target), NumericOutcome::Deferred(DeferReason::Overflow));
        // 10^36 * 10^6 does not fit 128 bits at all.
        let huge = format!("1{}", "0".repeat(35));
        assert_eq!(decode(&huge, &P38_S6), NumericOutcome::Deferred(DeferReason::Overflow));
    }

    #[test]
    fn test_rounding_modes() {
        let truncate = DecimalTarget { precision: 10, scale: 2, rounding: RoundingMode::Truncate };
        let half = DecimalTarget { rounding: RoundingMode::HalfAwayFromZero, ..truncate };
        assert_eq!(decode("1.005", &truncate), NumericOutcome::Decoded(100));
        assert_eq!(decode("1.005", &half), NumericOutcome::Decoded(101));
        assert_eq!(decode("-1.005", &half), NumericOutcome::Decoded(-101));
        assert_eq!(decode("1.0049", &half), NumericOutcome::Decoded(100));
        assert_eq!(decode("-2.999", &truncate), NumericOutcome::Decoded(-299));
    }

    #[test]
    fn test_negative_scale() {
        let target = DecimalTarget { precision: 5, scale: -2, rounding: RoundingMode::Truncate };
        assert_eq!(decode("12345", &target), NumericOutcome::Decoded(123));
    }

    #[test]
    fn test_malformed_numerics_fault() {
        let mut short = numeric_bytes(&[1, 2], 0, NUMERIC_POS, 0);
        short.pop();
        assert!(matches!(
            decode_numeric(Some(&short[..]), &P38_S6),
            Err(FaultKind::NumericLength { .. })
        ));

        let bad_digit = numeric_bytes(&[10_000], 0, NUMERIC_POS, 0);
        assert_eq!(decode_numeric(Some(&bad_digit[..]), &P38_S6), Err(FaultKind::NumericDigit(10_000)));

        let bad_sign = numeric_bytes(&[1], 0, 0x1234, 0);
        assert_eq!(decode_numeric(Some(&bad_sign[..]), &P38_S6), Err(FaultKind::NumericSign(0x1234)));
    }

    #[test]
    fn test_scatter_sets_overflow_mask() {
        let device = Arc::new(test_device());
        let values = [
            encode_numeric("1.5"),
            encode_numeric("1234567890123456789012345678901234567890"),
            encode_numeric("-0.000001"),
        ];
        let rows: Vec<Vec<Option<&[u8]>>> = vec![
            vec![Some(&values[0][..])],
            vec![None],
            vec![Some(&values[1][..])],
            vec![Some(&values[2][..])],
        ];
        let (bytes, starts) = encode_rows(&rows);
        let fields = ScanKernel::new(device.clone())
            .scan(ScanParams { bytes: &bytes, row_starts: &starts, columns: 1 })
            .unwrap()
            .fields;

        let mut dest = vec![0xFF; 4 * DECIMAL_WIDTH];
        let mask = DecimalKernel::new(device)
            .scatter(
                DecimalScatterParams { bytes: &bytes, fields: &fields, column: 0, target: P38_S6 },
                &mut dest,
            )
            .unwrap();

        let decoded: Vec<i128> = dest
            .chunks(DECIMAL_WIDTH)
            .map(|c| i128::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(decoded, vec![1_500_000, 0, 0, -1]);
        assert_eq!(mask.iter_set().collect::<Vec<_>>(), vec![2]);
    }
}
