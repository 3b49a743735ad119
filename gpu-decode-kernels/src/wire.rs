//! Big-endian readers and constants of the binary COPY row format.

/// Length prefix of a NULL field.
pub const NULL_LENGTH: i32 = -1;

/// Bytes of the per-row field count.
pub const FIELD_COUNT_BYTES: usize = 2;
/// Bytes of the per-field length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

pub const NUMERIC_POS: u16 = 0x0000;
pub const NUMERIC_NEG: u16 = 0x4000;
pub const NUMERIC_NAN: u16 = 0xC000;
pub const NUMERIC_PINF: u16 = 0xD000;
pub const NUMERIC_NINF: u16 = 0xF000;

/// Base of one numeric digit group.
pub const NBASE: u32 = 10_000;
/// Decimal digits per digit group.
pub const DEC_DIGITS: i32 = 4;
/// Bytes of the numeric header: ndigits, weight, sign, dscale.
pub const NUMERIC_HEADER_BYTES: usize = 8;
/// Most digit groups the device decodes; longer values go to the CPU.
pub const MAX_DEVICE_GROUPS: usize = 9;

#[inline]
pub fn read_i16(bytes: &[u8], at: usize) -> Option<i16> {
    let raw = bytes.get(at..at + 2)?;
    Some(i16::from_be_bytes([raw[0], raw[1]]))
}

#[inline]
pub fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let raw = bytes.get(at..at + 2)?;
    Some(u16::from_be_bytes([raw[0], raw[1]]))
}

#[inline]
pub fn read_i32(bytes: &[u8], at: usize) -> Option<i32> {
    let raw = bytes.get(at..at + 4)?;
    Some(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Header of a binary `numeric` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericHeader {
    pub ndigits: i16,
    pub weight: i16,
    pub sign: u16,
    pub dscale: i16,
}

impl NumericHeader {
    /// `None` if fewer than eight bytes are present.
    pub fn parse(field: &[u8]) -> Option<Self> {
        Some(Self {
            ndigits: read_i16(field, 0)?,
            weight: read_i16(field, 2)?,
            sign: read_u16(field, 4)?,
            dscale: read_i16(field, 6)?,
        })
    }

    /// Field length implied by `ndigits`.
    pub fn expected_len(&self) -> Option<usize> {
        usize::try_from(self.ndigits)
            .ok()
            .map(|n| NUMERIC_HEADER_BYTES + 2 * n)
    }

    /// Digit group `i`, most significant first.
    #[inline]
    pub fn digit(field: &[u8], i: usize) -> Option<u16> {
        read_u16(field, NUMERIC_HEADER_BYTES + 2 * i)
    }
}
