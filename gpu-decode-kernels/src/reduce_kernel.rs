//! Length Reduction: exclusive prefix sum of one variable-length column.
//!
//! Three launches, the classic block-wise device scan:
//! 1. every block sums the lengths of its rows,
//! 2. one thread scans the block totals,
//! 3. every block writes its rows' offsets starting from its block base.
//!
//! The result is the Arrow offset array: `rows + 1` entries, the last one
//! being the total byte count of the column.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::launch::Device;
use crate::scan_kernel::FieldTable;

/// The column holds more bytes than an `i32` offset can address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("column {column} holds {total} bytes, more than i32 offsets address")]
pub struct OffsetOverflow {
    pub column: usize,
    pub total: u64,
}

pub struct ReduceKernel {
    device: Arc<Device>,
}

impl ReduceKernel {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// Fill `offsets` (`fields.rows() + 1` entries) for `column` and return
    /// the total byte count.
    pub fn reduce(
        &self,
        fields: &FieldTable,
        column: usize,
        offsets: &mut [i32],
    ) -> Result<usize, OffsetOverflow> {
        let rows = fields.rows();
        debug_assert_eq!(offsets.len(), rows + 1);
        let block = self.device.launch_config().threads_per_block.max(1) as usize;
        let n_blocks = rows.div_ceil(block);

        let mut block_sums = vec![0u64; n_blocks];
        self.device.launch_slots(&mut block_sums, 1, |b, sum| {
            let first = b * block;
            let last = (first + block).min(rows);
            sum[0] = (first..last)
                .map(|row| fields.get(row, column).data_len() as u64)
                .sum();
        });

        // Exclusive scan of the block totals, in place.
        let mut running = 0u64;
        for sum in block_sums.iter_mut() {
            let len = *sum;
            *sum = running;
            running += len;
        }
        if running > i32::MAX as u64 {
            return Err(OffsetOverflow {
                column,
                total: running,
            });
        }

        let (body, last) = offsets.split_at_mut(rows);
        self.device.launch_slots(body, block, |b, slot| {
            let mut offset = block_sums[b] as i32;
            for (i, out) in slot.iter_mut().enumerate() {
                *out = offset;
                offset += fields.get(b * block + i, column).data_len() as i32;
            }
        });
        last[0] = running as i32;

        debug!(
            "Reduced column {}: {} rows in {} blocks, {} bytes",
            column, rows, n_blocks, running
        );
        Ok(running as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_kernel::{ScanKernel, ScanParams};
    use crate::test_util::{encode_rows, test_device};

    fn scan(rows: &[Vec<Option<&[u8]>>], device: &Arc<Device>) -> FieldTable {
        let (bytes, starts) = encode_rows(rows);
        let columns = rows.first().map_or(0, Vec::len);
        ScanKernel::new(device.clone())
            .scan(ScanParams { bytes: &bytes, row_starts: &starts, columns })
            .unwrap()
            .fields
    }

    #[test]
    fn test_offsets_skip_nulls() {
        let device = Arc::new(test_device());
        let fields = scan(
            &[
                vec![Some(&b"abc"[..])],
                vec![None],
                vec![Some(&b""[..])],
                vec![Some(&b"hello"[..])],
            ],
            &device,
        );
        let mut offsets = vec![-7; 5];
        let total = ReduceKernel::new(device).reduce(&fields, 0, &mut offsets).unwrap();
        assert_eq!(offsets, vec![0, 3, 3, 3, 8]);
        assert_eq!(total, 8);
    }

    #[test]
    fn test_block_scan_matches_sequential_sum() {
        let device = Arc::new(test_device());
        let payloads: Vec<Vec<u8>> = (0..103).map(|i| vec![b'x'; i % 11]).collect();
        let rows: Vec<Vec<Option<&[u8]>>> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| vec![(i % 5 != 0).then_some(p.as_slice())])
            .collect();
        let fields = scan(&rows, &device);

        let mut offsets = vec![0; 104];
        let total = ReduceKernel::new(device).reduce(&fields, 0, &mut offsets).unwrap();

        let mut expected = vec![0i32];
        for row in &rows {
            let len = row[0].map_or(0, <[u8]>::len) as i32;
            expected.push(expected.last().unwrap() + len);
        }
        assert_eq!(offsets, expected);
        assert_eq!(total as i32, *expected.last().unwrap());
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_empty_chunk_has_single_offset() {
        let device = Arc::new(test_device());
        let fields = scan(&[], &device);
        let mut offsets = vec![5];
        let total = ReduceKernel::new(device).reduce(&fields, 0, &mut offsets).unwrap();
        assert_eq!((offsets, total), (vec![0], 0));
    }
}
