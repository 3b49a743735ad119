//! Pass-1: one thread per row walks its length prefixes.
//!
//! The scan records where every field starts and how long it is, and builds
//! one null bitmap per column. Nothing is decoded yet.

use arrow_interop::{AtomicBitmap, NullBitmap};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::launch::{Device, FaultKind, FaultSlot, KernelFault};
use crate::wire::{read_i16, read_i32, FIELD_COUNT_BYTES, LENGTH_PREFIX_BYTES, NULL_LENGTH};

/// Position of one field's data inside the chunk bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Byte offset of the field data, 0 for NULL.
    pub offset: i32,
    /// Data length in bytes, -1 for NULL.
    pub length: i32,
}

impl FieldDescriptor {
    pub const NULL: FieldDescriptor = FieldDescriptor {
        offset: 0,
        length: NULL_LENGTH,
    };

    pub fn is_null(&self) -> bool {
        self.length == NULL_LENGTH
    }

    /// Length counted by the offset reduction: NULL contributes nothing.
    pub fn data_len(&self) -> usize {
        self.length.max(0) as usize
    }

    /// Byte range of the data in the chunk. Empty for NULL.
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + self.data_len()
    }
}

/// Row-major table of descriptors: `rows * columns` entries.
#[derive(Debug)]
pub struct FieldTable {
    descriptors: Vec<FieldDescriptor>,
    rows: usize,
    columns: usize,
}

impl FieldTable {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    #[inline]
    pub fn get(&self, row: usize, column: usize) -> FieldDescriptor {
        self.descriptors[row * self.columns + column]
    }

    /// Descriptors of one column, in row order.
    pub fn column(&self, column: usize) -> impl Iterator<Item = FieldDescriptor> + '_ {
        self.descriptors
            .iter()
            .skip(column)
            .step_by(self.columns.max(1))
            .copied()
    }

    /// Host bytes the table occupies, for scratch accounting.
    pub fn size_for(rows: usize, columns: usize) -> usize {
        rows * columns * std::mem::size_of::<FieldDescriptor>()
    }
}

#[derive(Debug)]
pub struct ScanOutput {
    pub fields: FieldTable,
    /// One bitmap per column, bit set = value present.
    pub validity: Vec<NullBitmap>,
}

pub struct ScanParams<'a> {
    pub bytes: &'a [u8],
    /// `rows + 1` entries; row `r` spans `row_starts[r]..row_starts[r + 1]`.
    pub row_starts: &'a [u32],
    pub columns: usize,
}

pub struct ScanKernel {
    device: Arc<Device>,
}

impl ScanKernel {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// Run Pass-1. Returns the lowest faulting row if any row is malformed.
    pub fn scan(&self, params: ScanParams<'_>) -> Result<ScanOutput, KernelFault> {
        let started = Instant::now();
        let rows = params.row_starts.len().saturating_sub(1);
        let columns = params.columns;
        let validity: Vec<AtomicBitmap> = (0..columns).map(|_| AtomicBitmap::new(rows)).collect();
        let faults = FaultSlot::new();
        let mut descriptors = vec![FieldDescriptor::NULL; rows * columns];

        let scan_one = |row: usize, slot: &mut [FieldDescriptor]| {
            if let Err((column, kind)) = scan_row(&params, row, slot, &validity) {
                faults.record(KernelFault { row, column, kind });
            }
        };
        if columns == 0 {
            self.device.launch_indexed(rows, |row| scan_one(row, &mut []));
        } else {
            self.device.launch_slots(&mut descriptors, columns, scan_one);
        }
        faults.into_result()?;

        debug!(
            "Pass-1 scanned {} rows x {} columns in {:?}",
            rows,
            columns,
            started.elapsed()
        );
        Ok(ScanOutput {
            fields: FieldTable {
                descriptors,
                rows,
                columns,
            },
            validity: validity.into_iter().map(AtomicBitmap::freeze).collect(),
        })
    }
}

/// Scan one row into its descriptor slot. On error the slot may be partly
/// written; the whole chunk is discarded anyway.
fn scan_row(
    params: &ScanParams<'_>,
    row: usize,
    slot: &mut [FieldDescriptor],
    validity: &[AtomicBitmap],
) -> Result<(), (usize, FaultKind)> {
    let start = params.row_starts[row] as usize;
    let end = params.row_starts[row + 1] as usize;
    let data = params
        .bytes
        .get(start..end)
        .ok_or((0, FaultKind::TruncatedPrefix { at: start }))?;

    let found = read_i16(data, 0).ok_or((0, FaultKind::TruncatedPrefix { at: start }))?;
    if found < 0 || found as usize != params.columns {
        return Err((
            0,
            FaultKind::FieldCount {
                found,
                expected: params.columns,
            },
        ));
    }

    let mut pos = FIELD_COUNT_BYTES;
    for (column, descriptor) in slot.iter_mut().enumerate() {
        let length = read_i32(data, pos).ok_or((column, FaultKind::TruncatedPrefix { at: start + pos }))?;
        pos += LENGTH_PREFIX_BYTES;
        if length == NULL_LENGTH {
            *descriptor = FieldDescriptor::NULL;
            continue;
        }
        if length < 0 {
            return Err((column, FaultKind::InvalidLength(length)));
        }
        if data.len() - pos < length as usize {
            return Err((
                column,
                FaultKind::FieldOutOfBounds {
                    at: start + pos,
                    length,
                },
            ));
        }
        *descriptor = FieldDescriptor {
            offset: (start + pos) as i32,
            length,
        };
        validity[column].set(row);
        pos += length as usize;
    }

    if pos != data.len() {
        return Err((
            params.columns.saturating_sub(1),
            FaultKind::TrailingBytes(data.len() - pos),
        ));
    }
    Ok(())
}
