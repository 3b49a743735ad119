//! Pass-2 scatters for fixed-width and variable-length columns.

use arrow_interop::FixedTransform;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::launch::{Device, FaultKind, FaultSlot, KernelFault};
use crate::scan_kernel::FieldTable;

pub struct FixedScatterParams<'a> {
    pub bytes: &'a [u8],
    pub fields: &'a FieldTable,
    pub column: usize,
    pub width: u32,
    pub transform: FixedTransform,
}

pub struct ScatterKernel {
    device: Arc<Device>,
}

impl ScatterKernel {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// One thread per row writes `width` bytes at `row * width` of `dest`.
    /// NULL rows leave a zeroed slot.
    pub fn scatter_fixed(
        &self,
        params: FixedScatterParams<'_>,
        dest: &mut [u8],
    ) -> Result<(), KernelFault> {
        let started = Instant::now();
        let width = params.width as usize;
        debug_assert_eq!(dest.len(), params.fields.rows() * width);
        let faults = FaultSlot::new();

        self.device.launch_slots(dest, width, |row, slot| {
            let field = params.fields.get(row, params.column);
            if field.is_null() {
                slot.fill(0);
                return;
            }
            if field.length != params.width as i32 {
                slot.fill(0);
                faults.record(KernelFault {
                    row,
                    column: params.column,
                    kind: FaultKind::WidthMismatch {
                        found: field.length,
                        expected: params.width,
                    },
                });
                return;
            }
            write_fixed(&params.bytes[field.range()], params.transform, slot);
        });
        faults.into_result()?;

        debug!(
            "Scattered fixed column {} ({} bytes/row, {:?}) in {:?}",
            params.column,
            width,
            params.transform,
            started.elapsed()
        );
        Ok(())
    }

    /// One thread per row copies its bytes verbatim into
    /// `values[offsets[row]..offsets[row + 1]]`. Returns the bytes copied.
    ///
    /// A field whose length disagrees with its segment is a fault and its
    /// segment is zeroed.
    pub fn scatter_varlen(
        &self,
        bytes: &[u8],
        fields: &FieldTable,
        column: usize,
        offsets: &[i32],
        values: &mut [u8],
    ) -> Result<usize, KernelFault> {
        let started = Instant::now();
        let faults = FaultSlot::new();
        let written = AtomicUsize::new(0);

        self.device.launch_segments(values, offsets, |row, segment| {
            let field = fields.get(row, column);
            if field.data_len() != segment.len() {
                segment.fill(0);
                faults.record(KernelFault {
                    row,
                    column,
                    kind: FaultKind::SegmentMismatch {
                        found: field.data_len(),
                        expected: segment.len(),
                    },
                });
                return;
            }
            segment.copy_from_slice(&bytes[field.range()]);
            written.fetch_add(segment.len(), Ordering::Relaxed);
        });
        faults.into_result()?;

        let written = written.into_inner();
        debug!(
            "Scattered variable column {}: {} bytes in {:?}",
            column,
            written,
            started.elapsed()
        );
        Ok(written)
    }
}

fn write_fixed(src: &[u8], transform: FixedTransform, slot: &mut [u8]) {
    match transform {
        FixedTransform::Verbatim => slot.copy_from_slice(src),
        FixedTransform::ByteSwap => {
            for (out, b) in slot.iter_mut().zip(src.iter().rev()) {
                *out = *b;
            }
        }
        FixedTransform::ShiftDays(days) => {
            let v = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            // i32::MIN and i32::MAX are -infinity / infinity.
            let v = match v {
                i32::MIN | i32::MAX => v,
                v => v.saturating_add(days),
            };
            slot.copy_from_slice(&v.to_le_bytes());
        }
        FixedTransform::ShiftMicros(micros) => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(src);
            let v = match i64::from_be_bytes(raw) {
                v @ (i64::MIN | i64::MAX) => v,
                v => v.saturating_add(micros),
            };
            slot.copy_from_slice(&v.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce_kernel::ReduceKernel;
    use crate::scan_kernel::{ScanKernel, ScanParams};
    use crate::test_util::{encode_rows, test_device};

    fn setup(rows: &[Vec<Option<&[u8]>>]) -> (Arc<Device>, Vec<u8>, FieldTable) {
        let device = Arc::new(test_device());
        let (bytes, starts) = encode_rows(rows);
        let columns = rows.first().map_or(0, Vec::len);
        let fields = ScanKernel::new(device.clone())
            .scan(ScanParams { bytes: &bytes, row_starts: &starts, columns })
            .unwrap()
            .fields;
        (device, bytes, fields)
    }

    fn scatter(
        rows: &[Vec<Option<&[u8]>>],
        width: u32,
        transform: FixedTransform,
    ) -> Result<Vec<u8>, KernelFault> {
        let (device, bytes, fields) = setup(rows);
        let mut dest = vec![0xAA; rows.len() * width as usize];
        ScatterKernel::new(device).scatter_fixed(
            FixedScatterParams { bytes: &bytes, fields: &fields, column: 0, width, transform },
            &mut dest,
        )?;
        Ok(dest)
    }

    #[test]
    fn test_int32_byte_swap_and_null() {
        let a = 7i32.to_be_bytes();
        let b = (-3i32).to_be_bytes();
        let out = scatter(
            &[vec![Some(&a[..])], vec![None], vec![Some(&b[..])]],
            4,
            FixedTransform::ByteSwap,
        )
        .unwrap();
        let values: Vec<i32> = out
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![7, 0, -3]);
    }

    #[test]
    fn test_float8_byte_swap() {
        let v = 2.5f64.to_be_bytes();
        let out = scatter(&[vec![Some(&v[..])]], 8, FixedTransform::ByteSwap).unwrap();
        assert_eq!(f64::from_le_bytes(out.try_into().unwrap()), 2.5);
    }

    #[test]
    fn test_date_shifts_to_unix_epoch() {
        let day_one = 1i32.to_be_bytes();
        let infinity = i32::MAX.to_be_bytes();
        let out = scatter(
            &[vec![Some(&day_one[..])], vec![Some(&infinity[..])]],
            4,
            FixedTransform::ShiftDays(10_957),
        )
        .unwrap();
        assert_eq!(i32::from_le_bytes(out[..4].try_into().unwrap()), 10_958);
        assert_eq!(i32::from_le_bytes(out[4..].try_into().unwrap()), i32::MAX);
    }

    #[test]
    fn test_timestamp_shifts_to_unix_epoch() {
        let zero = 0i64.to_be_bytes();
        let out = scatter(&[vec![Some(&zero[..])]], 8, FixedTransform::ShiftMicros(946_684_800_000_000)).unwrap();
        assert_eq!(i64::from_le_bytes(out.try_into().unwrap()), 946_684_800_000_000);
    }

    #[test]
    fn test_uuid_copies_verbatim() {
        let uuid: Vec<u8> = (0..16).collect();
        let out = scatter(&[vec![Some(&uuid[..])]], 16, FixedTransform::Verbatim).unwrap();
        assert_eq!(out, uuid);
    }

    #[test]
    fn test_wrong_width_is_a_fault() {
        let short = [1u8, 2];
        let fault = scatter(&[vec![None], vec![Some(&short[..])]], 4, FixedTransform::ByteSwap)
            .unwrap_err();
        assert_eq!(fault.row, 1);
        assert_eq!(fault.kind, FaultKind::WidthMismatch { found: 2, expected: 4 });
    }

    #[test]
    fn test_varlen_copies_into_reduced_offsets() {
        let rows = [
            vec![Some(&b"alpha"[..])],
            vec![None],
            vec![Some(&b""[..])],
            vec![Some(&b"z"[..])],
        ];
        let (device, bytes, fields) = setup(&rows);
        let mut offsets = vec![0; 5];
        let total = ReduceKernel::new(device.clone()).reduce(&fields, 0, &mut offsets).unwrap();
        let mut values = vec![0; total];
        let written = ScatterKernel::new(device)
            .scatter_varlen(&bytes, &fields, 0, &offsets, &mut values)
            .unwrap();
        assert_eq!(total, 6);
        assert_eq!(written, total);
        assert_eq!(values, b"alphaz");
    }

    #[test]
    fn test_varlen_segment_mismatch_is_a_fault() {
        let rows = [vec![Some(&b"ab"[..])], vec![Some(&b"cde"[..])], vec![Some(&b"f"[..])]];
        let (device, bytes, fields) = setup(&rows);
        // Offsets that give row 1 one byte too few and row 2 one too many.
        let offsets = [0, 2, 4, 6];
        let mut values = vec![0xAA; 6];
        let fault = ScatterKernel::new(device)
            .scatter_varlen(&bytes, &fields, 0, &offsets, &mut values)
            .unwrap_err();
        assert_eq!(fault.row, 1);
        assert_eq!(fault.kind, FaultKind::SegmentMismatch { found: 3, expected: 2 });
        assert_eq!(&values[..2], b"ab");
        assert_eq!(&values[2..], &[0, 0, 0, 0]);
    }
}
