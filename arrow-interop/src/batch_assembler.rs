//! Binds finished destination buffers into an Arrow `RecordBatch`.
//!
//! No values are copied: each `DestBuffer` becomes an Arrow `Buffer` as is,
//! and its lease travels with the batch so the memory manager keeps counting
//! it until the batch is dropped.

use arrow_array::types::{
    Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    TimestampMicrosecondType,
};
use arrow_array::{
    ArrayRef, BinaryArray, Decimal128Array, FixedSizeBinaryArray, PrimitiveArray, RecordBatch,
    RecordBatchOptions, StringArray,
};
use arrow_buffer::{ArrowNativeType, BooleanBuffer, Buffer, NullBuffer, OffsetBuffer, ScalarBuffer};
use arrow_schema::{ArrowError, SchemaRef};
use gpu_memory_manager::{DestBuffer, Lease, OFFSET_WIDTH};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::bitmap::Bitmap;
use crate::column_meta::{ArrowKind, ColumnClass, ColumnMeta};

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    /// A buffer does not match its column's metadata. Always a bug upstream.
    #[error("column {column} ('{name}'): {detail}")]
    Invariant {
        column: usize,
        name: String,
        detail: String,
    },
}

/// Device buffers of one finished column.
#[derive(Debug)]
pub enum ColumnBuffers {
    Fixed(DestBuffer),
    Variable { offsets: DestBuffer, values: DestBuffer },
}

/// Everything Pass-2 produced for one column.
#[derive(Debug)]
pub struct FinishedColumn {
    pub buffers: ColumnBuffers,
    /// Null bitmap from the scan (bit set = value present).
    pub validity: Bitmap,
    /// Rows deferred to the CPU, for Decimal128 columns.
    pub overflow: Option<Bitmap>,
}

/// An assembled batch plus the leases that back its buffers.
#[derive(Debug)]
pub struct AssembledBatch {
    pub batch: RecordBatch,
    pub leases: Vec<Lease>,
}

/// Build one `RecordBatch` from the columns of a chunk.
///
/// Rows flagged in an overflow mask are reported invalid in the Arrow
/// validity: their slot holds zeros, not a decoded value.
pub fn assemble_batch(
    schema: SchemaRef,
    metas: &[ColumnMeta],
    columns: Vec<FinishedColumn>,
    row_count: usize,
) -> Result<AssembledBatch, AssembleError> {
    if metas.len() != columns.len() || schema.fields().len() != metas.len() {
        return Err(AssembleError::Invariant {
            column: columns.len(),
            name: String::new(),
            detail: format!(
                "{} metas, {} schema fields, {} columns",
                metas.len(),
                schema.fields().len(),
                columns.len()
            ),
        });
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    let mut leases = Vec::with_capacity(columns.len() * 2);

    for (index, (meta, column)) in metas.iter().zip(columns).enumerate() {
        let invariant = |detail: String| AssembleError::Invariant {
            column: index,
            name: meta.name.clone(),
            detail,
        };

        if column.validity.len() != row_count {
            return Err(invariant(format!(
                "null bitmap covers {} rows, chunk has {}",
                column.validity.len(),
                row_count
            )));
        }

        let validity = match &column.overflow {
            Some(overflow) => column.validity.and_not(overflow),
            None => column.validity,
        };
        let nulls = null_buffer(validity);

        let array: ArrayRef = match (meta.class(), column.buffers) {
            (ColumnClass::Variable, ColumnBuffers::Variable { offsets, values }) => {
                if offsets.capacity() != (row_count + 1) * OFFSET_WIDTH {
                    return Err(invariant(format!(
                        "offset buffer holds {} bytes for {} rows",
                        offsets.capacity(),
                        row_count
                    )));
                }
                let (offsets, offsets_lease) = offsets.into_parts();
                let (values, values_lease) = values.into_parts();
                leases.push(offsets_lease);
                leases.push(values_lease);

                let offsets =
                    OffsetBuffer::new(ScalarBuffer::<i32>::new(offsets.into(), 0, row_count + 1));
                let values: Buffer = values.into();
                match meta.arrow_kind {
                    ArrowKind::Utf8 => Arc::new(StringArray::try_new(offsets, values, nulls)?),
                    _ => Arc::new(BinaryArray::try_new(offsets, values, nulls)?),
                }
            }
            (ColumnClass::Fixed { width, .. }, ColumnBuffers::Fixed(data)) => {
                check_stride(&data, width, row_count).map_err(invariant)?;
                let (data, lease) = data.into_parts();
                leases.push(lease);
                fixed_array(meta, data.into(), width, row_count, nulls)?
            }
            (ColumnClass::Decimal { precision, scale }, ColumnBuffers::Fixed(data)) => {
                check_stride(&data, 16, row_count).map_err(invariant)?;
                let (data, lease) = data.into_parts();
                leases.push(lease);
                Arc::new(
                    Decimal128Array::try_new(values::<i128>(data.into(), row_count), nulls)?
                        .with_precision_and_scale(precision, scale)?,
                )
            }
            (class, _) => {
                return Err(invariant(format!(
                    "buffers do not match column class {:?}",
                    class
                )))
            }
        };
        arrays.push(array);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(row_count));
    let batch = RecordBatch::try_new_with_options(schema, arrays, &options)?;
    debug!(
        "Assembled batch: {} rows, {} columns",
        batch.num_rows(),
        batch.num_columns()
    );
    Ok(AssembledBatch { batch, leases })
}

fn check_stride(data: &DestBuffer, width: u32, row_count: usize) -> Result<(), String> {
    if data.stride() != width {
        return Err(format!(
            "buffer stride {} does not match declared width {}",
            data.stride(),
            width
        ));
    }
    if data.capacity() != row_count * width as usize {
        return Err(format!(
            "buffer holds {} bytes, expected {} rows x {}",
            data.capacity(),
            row_count,
            width
        ));
    }
    Ok(())
}

fn values<T: ArrowNativeType>(buffer: Buffer, row_count: usize) -> ScalarBuffer<T> {
    ScalarBuffer::new(buffer, 0, row_count)
}

fn fixed_array(
    meta: &ColumnMeta,
    data: Buffer,
    width: u32,
    row_count: usize,
    nulls: Option<NullBuffer>,
) -> Result<ArrayRef, ArrowError> {
    Ok(match meta.arrow_kind {
        ArrowKind::Int16 => Arc::new(PrimitiveArray::<Int16Type>::try_new(values(data, row_count), nulls)?),
        ArrowKind::Int32 => Arc::new(PrimitiveArray::<Int32Type>::try_new(values(data, row_count), nulls)?),
        ArrowKind::Int64 => Arc::new(PrimitiveArray::<Int64Type>::try_new(values(data, row_count), nulls)?),
        ArrowKind::Float32 => Arc::new(PrimitiveArray::<Float32Type>::try_new(values(data, row_count), nulls)?),
        ArrowKind::Float64 => Arc::new(PrimitiveArray::<Float64Type>::try_new(values(data, row_count), nulls)?),
        ArrowKind::Date32 => Arc::new(PrimitiveArray::<Date32Type>::try_new(values(data, row_count), nulls)?),
        ArrowKind::TimestampMicros { utc } => {
            let array = PrimitiveArray::<TimestampMicrosecondType>::try_new(values(data, row_count), nulls)?;
            if utc {
                Arc::new(array.with_timezone("UTC"))
            } else {
                Arc::new(array)
            }
        }
        ArrowKind::FixedSizeBinary => {
            Arc::new(FixedSizeBinaryArray::try_new(width as i32, data, nulls)?)
        }
        other => {
            return Err(ArrowError::InvalidArgumentError(format!(
                "column '{}': {:?} is not a fixed-width kind",
                meta.name, other
            )))
        }
    })
}

fn null_buffer(validity: Bitmap) -> Option<NullBuffer> {
    let len = validity.len();
    if validity.count_set() == len {
        return None;
    }
    let bits = Buffer::from_vec(validity.into_bytes());
    Some(NullBuffer::new(BooleanBuffer::new(bits, 0, len)))
}
