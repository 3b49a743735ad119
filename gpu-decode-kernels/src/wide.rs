//! Unsigned 128-bit integer held as a hi/lo word pair.
//!
//! Device code has no native 128-bit type, so the numeric kernel works on two
//! 64-bit words. Multiplication and division go through 32-bit limbs so every
//! partial product fits in a `u64`.

use std::cmp::Ordering;

/// Largest power of ten applied in one limb pass.
const CHUNK_POW10: u32 = 9;
const CHUNK_SCALE: u32 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WideInt {
    pub hi: u64,
    pub lo: u64,
}

impl WideInt {
    pub const ZERO: WideInt = WideInt { hi: 0, lo: 0 };

    pub const fn from_u64(v: u64) -> Self {
        Self { hi: 0, lo: v }
    }

    pub fn is_zero(&self) -> bool {
        self.hi == 0 && self.lo == 0
    }

    /// Limbs, least significant first.
    fn limbs(&self) -> [u32; 4] {
        [
            self.lo as u32,
            (self.lo >> 32) as u32,
            self.hi as u32,
            (self.hi >> 32) as u32,
        ]
    }

    fn from_limbs(l: [u32; 4]) -> Self {
        Self {
            lo: (l[0] as u64) | ((l[1] as u64) << 32),
            hi: (l[2] as u64) | ((l[3] as u64) << 32),
        }
    }

    /// `self * m + a`, `None` on overflow.
    pub fn checked_mul_add_small(&self, m: u32, a: u32) -> Option<Self> {
        let mut limbs = self.limbs();
        let mut carry = a as u64;
        for limb in limbs.iter_mut() {
            let t = (*limb as u64) * (m as u64) + carry;
            *limb = t as u32;
            carry = t >> 32;
        }
        (carry == 0).then(|| Self::from_limbs(limbs))
    }

    pub fn checked_mul_small(&self, m: u32) -> Option<Self> {
        self.checked_mul_add_small(m, 0)
    }

    /// Quotient and remainder of division by a non-zero `d`.
    pub fn div_rem_small(&self, d: u32) -> (Self, u32) {
        debug_assert!(d != 0);
        let mut limbs = self.limbs();
        let mut rem = 0u64;
        for limb in limbs.iter_mut().rev() {
            let cur = (rem << 32) | *limb as u64;
            *limb = (cur / d as u64) as u32;
            rem = cur % d as u64;
        }
        (Self::from_limbs(limbs), rem as u32)
    }

    /// `self * 10^exp`, `None` on overflow.
    pub fn checked_mul_pow10(&self, exp: u32) -> Option<Self> {
        let mut value = *self;
        let mut left = exp;
        while left > 0 {
            let step = left.min(CHUNK_POW10);
            value = value.checked_mul_small(pow10_u32(step))?;
            left -= step;
        }
        Some(value)
    }

    /// `self / 10^exp`, truncated.
    pub fn div_pow10(&self, exp: u32) -> Self {
        let mut value = *self;
        let mut left = exp;
        while left > 0 && !value.is_zero() {
            let step = left.min(CHUNK_POW10);
            value = value.div_rem_small(pow10_u32(step)).0;
            left -= step;
        }
        value
    }

    /// `10^exp`, `None` above 10^38.
    pub fn pow10(exp: u32) -> Option<Self> {
        Self::from_u64(1).checked_mul_pow10(exp)
    }

    /// Two's complement negation on the word pair.
    pub fn wrapping_neg(&self) -> Self {
        let (lo, carry) = (!self.lo).overflowing_add(1);
        let hi = (!self.hi).wrapping_add(carry as u64);
        Self { hi, lo }
    }

    /// Little-endian bytes: low word first.
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.lo.to_le_bytes());
        out[8..].copy_from_slice(&self.hi.to_le_bytes());
        out
    }

    pub fn as_u128(&self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }

    pub fn from_u128(v: u128) -> Self {
        Self {
            hi: (v >> 64) as u64,
            lo: v as u64,
        }
    }
}

impl Ord for WideInt {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.hi, self.lo).cmp(&(other.hi, other.lo))
    }
}

impl PartialOrd for WideInt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn pow10_u32(exp: u32) -> u32 {
    debug_assert!(exp <= CHUNK_POW10);
    match exp {
        CHUNK_POW10 => CHUNK_SCALE,
        e => 10u32.pow(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_negation_matches_i128() {
        let v = WideInt::from_u64(987_654_321_123_456);
        let neg = v.wrapping_neg();
        assert_eq!(neg.as_u128() as i128, -987_654_321_123_456i128);
        assert_eq!(
            i128::from_le_bytes(neg.to_le_bytes()),
            -987_654_321_123_456i128
        );
        assert_eq!(WideInt::ZERO.wrapping_neg(), WideInt::ZERO);
    }

    #[test]
    fn test_negation_at_the_word_edges() {
        let one = WideInt::from_u64(1).wrapping_neg();
        assert_eq!(one.as_u128(), u128::MAX);
        assert_eq!(i128::from_le_bytes(one.to_le_bytes()), -1);

        // Only the sign bit set: its own negation, like i128::MIN.
        let min = WideInt::from_u128(1 << 127);
        assert_eq!(min.wrapping_neg(), min);
        assert_eq!(i128::from_le_bytes(min.wrapping_neg().to_le_bytes()), i128::MIN);

        // The +1 carries out of the low word.
        let high_only = WideInt::from_u128(1 << 64);
        assert_eq!(high_only.wrapping_neg().as_u128(), (1u128 << 64).wrapping_neg());
    }

    #[test]
    fn test_pow10_limits() {
        assert_eq!(WideInt::pow10(38).map(|v| v.as_u128()), Some(10u128.pow(38)));
        assert!(WideInt::pow10(39).is_none());
        assert_eq!(WideInt::pow10(0), Some(WideInt::from_u64(1)));
    }

    #[test]
    fn test_carry_crosses_the_word_boundary() {
        let v = WideInt::from_u64(u64::MAX);
        let doubled = v.checked_mul_add_small(2, 1).unwrap();
        assert_eq!(doubled.as_u128(), u64::MAX as u128 * 2 + 1);
        assert_eq!(doubled.hi, 1);
    }

    proptest! {
        #[test]
        fn test_mul_add_matches_u128(v in any::<u128>(), m in any::<u32>(), a in any::<u32>()) {
            let expected = v.checked_mul(m as u128).and_then(|p| p.checked_add(a as u128));
            let got = WideInt::from_u128(v).checked_mul_add_small(m, a).map(|w| w.as_u128());
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn test_div_rem_matches_u128(v in any::<u128>(), d in 1u32..=u32::MAX) {
            let (q, r) = WideInt::from_u128(v).div_rem_small(d);
            prop_assert_eq!(q.as_u128(), v / d as u128);
            prop_assert_eq!(r as u128, v % d as u128);
        }

        #[test]
        fn test_pow10_scaling_matches_u128(v in any::<u128>(), e in 0u32..45) {
            let expected = match v {
                0 => Some(0),
                _ => 10u128.checked_pow(e).and_then(|p| v.checked_mul(p)),
            };
            let got = WideInt::from_u128(v).checked_mul_pow10(e).map(|w| w.as_u128());
            prop_assert_eq!(got, expected);

            let divided = WideInt::from_u128(v).div_pow10(e).as_u128();
            let expected = 10u128.checked_pow(e).map(|p| v / p).unwrap_or(0);
            prop_assert_eq!(divided, expected);
        }

        #[test]
        fn test_negation_matches_u128(v in any::<u128>()) {
            prop_assert_eq!(WideInt::from_u128(v).wrapping_neg().as_u128(), v.wrapping_neg());
            prop_assert_eq!(WideInt::from_u128(v).wrapping_neg().wrapping_neg().as_u128(), v);
        }

        #[test]
        fn test_ordering_matches_u128(a in any::<u128>(), b in any::<u128>()) {
            prop_assert_eq!(WideInt::from_u128(a).cmp(&WideInt::from_u128(b)), a.cmp(&b));
        }
    }
}
