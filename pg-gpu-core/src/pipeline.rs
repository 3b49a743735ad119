//! Per-chunk decode as a typestate machine.
//!
//! ```text
//! Staged --scan--> Scanned --reduce--> Reduced --scatter--> Scattered --assemble--> DecodedBatch
//! ```
//!
//! Every transition consumes the previous stage and moves its buffers on.
//! Dropping a stage cancels the chunk: its leases go back to the memory
//! manager and no partially written buffer is ever visible.

use arrow_array::RecordBatch;
use arrow_interop::{
    assemble_batch, ColumnBuffers, ColumnClass, ColumnMeta, FinishedColumn, NullBitmap,
};
use gpu_decode_kernels::{
    decode_numeric, DecimalScatterParams, DecimalTarget, DeferReason, FieldTable,
    FixedScatterParams, KernelFault, NumericOutcome, ScanOutput, ScanParams,
};
use gpu_memory_manager::{AllocationKind, ColumnAllocation, DestBuffer, Lease, VarlenBuffers};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::DecodeError;
use crate::fallback::FallbackRow;
use crate::raw_chunk::RawChunk;
use crate::DecoderShared;

/// One chunk of rows decoded into Arrow columns.
///
/// The batch's buffers stay counted against the device budget until this
/// value is dropped.
#[derive(Debug)]
pub struct DecodedBatch {
    pub batch: RecordBatch,
    /// Deferred values, ordered by column then row.
    pub fallback: Vec<FallbackRow>,
    leases: Vec<Lease>,
}

impl DecodedBatch {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Bytes of device budget the batch holds.
    pub fn device_bytes(&self) -> usize {
        self.leases.iter().map(Lease::bytes).sum()
    }

    /// Give up the budget accounting and keep the data.
    pub fn into_parts(self) -> (RecordBatch, Vec<FallbackRow>) {
        (self.batch, self.fallback)
    }
}

pub struct Staged {
    chunk: RawChunk,
}

pub struct Scanned {
    chunk: RawChunk,
    scan: ScanOutput,
    /// Staged chunk bytes and the descriptor table.
    scratch: Lease,
    plan: Vec<ColumnAllocation>,
}

enum ReadyColumn {
    Fixed(DestBuffer),
    Variable(VarlenBuffers),
}

pub struct Reduced {
    chunk: RawChunk,
    scan: ScanOutput,
    scratch: Lease,
    columns: Vec<ReadyColumn>,
}

pub struct Scattered {
    chunk: RawChunk,
    scratch: Lease,
    columns: Vec<FinishedColumn>,
}

/// A chunk in stage `S` of the decode.
pub struct ChunkPipeline<S> {
    shared: Arc<DecoderShared>,
    state: S,
}

impl ChunkPipeline<Staged> {
    pub(crate) fn new(shared: Arc<DecoderShared>, chunk: RawChunk) -> Self {
        Self {
            shared,
            state: Staged { chunk },
        }
    }

    /// Reserve the chunk's memory, pre-size fixed columns and run Pass-1.
    pub fn scan(self) -> Result<ChunkPipeline<Scanned>, DecodeError> {
        let Self { shared, state } = self;
        let chunk = state.chunk;
        let rows = chunk.row_count();
        let columns = shared.metas.len();

        let scratch_bytes = chunk.bytes().len() + FieldTable::size_for(rows, columns);
        let scratch = shared.memory.reserve(AllocationKind::Scratch, scratch_bytes)?;
        let layouts: Vec<_> = shared.metas.iter().map(ColumnMeta::layout).collect();
        let plan = shared.memory.plan(rows, &layouts)?;

        let scan = shared.scan.scan(ScanParams {
            bytes: chunk.bytes(),
            row_starts: chunk.row_starts(),
            columns,
        })?;

        Ok(ChunkPipeline {
            shared,
            state: Scanned {
                chunk,
                scan,
                scratch,
                plan,
            },
        })
    }
}

impl ChunkPipeline<Scanned> {
    /// Resolve offsets and value buffers of every variable-length column.
    pub fn reduce(self) -> Result<ChunkPipeline<Reduced>, DecodeError> {
        let Self { shared, state } = self;
        let Scanned {
            chunk,
            scan,
            scratch,
            plan,
        } = state;
        let started = Instant::now();
        let fields = &scan.fields;
        let reducer = &shared.reduce;

        let columns = shared.device.run(|| {
            plan.into_par_iter()
                .enumerate()
                .map(
                    |(column, allocation)| -> Result<ReadyColumn, DecodeError> {
                        match allocation {
                            ColumnAllocation::Fixed(buffer) => Ok(ReadyColumn::Fixed(buffer)),
                            ColumnAllocation::Variable(mut pending) => {
                                let total =
                                    reducer.reduce(fields, column, pending.offsets_mut())?;
                                Ok(ReadyColumn::Variable(pending.resolve(total)?))
                            }
                        }
                    },
                )
                .collect::<Result<Vec<_>, _>>()
        })?;
        debug!("Length reduction done in {:?}", started.elapsed());

        Ok(ChunkPipeline {
            shared,
            state: Reduced {
                chunk,
                scan,
                scratch,
                columns,
            },
        })
    }
}

impl ChunkPipeline<Reduced> {
    /// Run the Pass-2 kernel of every column, columns in parallel.
    pub fn scatter(self) -> Result<ChunkPipeline<Scattered>, DecodeError> {
        let Self { shared, state } = self;
        let Reduced {
            chunk,
            scan,
            scratch,
            columns,
        } = state;
        let ScanOutput { fields, validity } = scan;
        let started = Instant::now();
        let bytes: &[u8] = chunk.bytes();

        let results: Vec<Result<FinishedColumn, KernelFault>> = shared.device.run(|| {
            columns
                .into_par_iter()
                .zip(validity)
                .zip(shared.metas.par_iter())
                .enumerate()
                .map(|(column, ((ready, validity), meta))| {
                    scatter_column(&shared, bytes, &fields, column, meta, ready, validity)
                })
                .collect()
        });

        // Lowest (row, column) fault, so reruns report the same one.
        let mut finished = Vec::with_capacity(results.len());
        let mut first_fault: Option<KernelFault> = None;
        for result in results {
            match result {
                Ok(column) => finished.push(column),
                Err(fault) => {
                    let lower = first_fault
                        .as_ref()
                        .map_or(true, |f| (fault.row, fault.column) < (f.row, f.column));
                    if lower {
                        first_fault = Some(fault);
                    }
                }
            }
        }
        if let Some(fault) = first_fault {
            return Err(fault.into());
        }
        debug!("Pass-2 done in {:?}", started.elapsed());

        Ok(ChunkPipeline {
            shared,
            state: Scattered {
                chunk,
                scratch,
                columns: finished,
            },
        })
    }
}

fn scatter_column(
    shared: &DecoderShared,
    bytes: &[u8],
    fields: &FieldTable,
    column: usize,
    meta: &ColumnMeta,
    ready: ReadyColumn,
    validity: NullBitmap,
) -> Result<FinishedColumn, KernelFault> {
    let (buffers, overflow) = match (meta.class(), ready) {
        (ColumnClass::Fixed { width, transform }, ReadyColumn::Fixed(mut dest)) => {
            shared.scatter.scatter_fixed(
                FixedScatterParams {
                    bytes,
                    fields,
                    column,
                    width,
                    transform,
                },
                dest.as_mut_slice(),
            )?;
            (ColumnBuffers::Fixed(dest), None)
        }
        (ColumnClass::Decimal { precision, scale }, ReadyColumn::Fixed(mut dest)) => {
            let target = DecimalTarget {
                precision,
                scale,
                rounding: shared.rounding,
            };
            let mask = shared.decimal.scatter(
                DecimalScatterParams {
                    bytes,
                    fields,
                    column,
                    target,
                },
                dest.as_mut_slice(),
            )?;
            (ColumnBuffers::Fixed(dest), Some(mask))
        }
        (_, ReadyColumn::Variable(VarlenBuffers { offsets, mut values })) => {
            let written = shared.scatter.scatter_varlen(
                bytes,
                fields,
                column,
                offsets.typed::<i32>(),
                values.as_mut_slice(),
            )?;
            debug_assert_eq!(written, values.as_slice().len());
            (ColumnBuffers::Variable { offsets, values }, None)
        }
        // A fixed buffer for a variable column cannot come out of `plan`;
        // hand it on and let the assembler reject it.
        (_, ReadyColumn::Fixed(dest)) => (ColumnBuffers::Fixed(dest), None),
    };
    Ok(FinishedColumn {
        buffers,
        validity,
        overflow,
    })
}

impl ChunkPipeline<Scattered> {
    /// Bind the columns into a record batch and collect deferred rows.
    pub fn assemble(self) -> Result<DecodedBatch, DecodeError> {
        let Self { shared, state } = self;
        let Scattered {
            chunk,
            scratch,
            columns,
        } = state;
        let rows = chunk.row_count();

        let fallback = collect_fallback(&shared, &chunk, &columns);
        let assembled = assemble_batch(shared.schema.clone(), &shared.metas, columns, rows)?;
        drop(scratch);

        if !fallback.is_empty() {
            debug!("{} values deferred to the CPU", fallback.len());
        }
        Ok(DecodedBatch {
            batch: assembled.batch,
            fallback,
            leases: assembled.leases,
        })
    }
}

/// Raw bytes of every row flagged in an overflow mask.
fn collect_fallback(
    shared: &DecoderShared,
    chunk: &RawChunk,
    columns: &[FinishedColumn],
) -> Vec<FallbackRow> {
    let mut fallback = Vec::new();
    for (column, finished) in columns.iter().enumerate() {
        let Some(mask) = &finished.overflow else {
            continue;
        };
        let target = match shared.metas[column].class() {
            ColumnClass::Decimal { precision, scale } => DecimalTarget {
                precision,
                scale,
                rounding: shared.rounding,
            },
            _ => continue,
        };
        for row in mask.iter_set() {
            let raw = field_bytes(chunk, row, column);
            let reason = match decode_numeric(Some(&raw[..]), &target) {
                Ok(NumericOutcome::Deferred(reason)) => reason,
                _ => DeferReason::Overflow,
            };
            fallback.push(FallbackRow {
                column,
                row,
                raw,
                reason,
            });
        }
    }
    fallback
}

/// Field `column` of row `row` as a zero-copy slice of the chunk.
fn field_bytes(chunk: &RawChunk, row: usize, column: usize) -> bytes::Bytes {
    let start = chunk.row_starts()[row] as usize;
    let data = chunk.row(row);
    let mut pos = 2;
    for _ in 0..column {
        let length = i32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        pos += 4 + length.max(0) as usize;
    }
    let length = i32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
    let from = start + pos + 4;
    chunk.bytes().slice(from..from + length.max(0) as usize)
}

/// Drive a chunk through every stage.
pub(crate) fn decode_chunk(
    shared: Arc<DecoderShared>,
    chunk: RawChunk,
) -> Result<DecodedBatch, DecodeError> {
    let started = Instant::now();
    let rows = chunk.row_count();
    let bytes = chunk.bytes().len();
    let first_row = chunk.first_row();

    let batch = ChunkPipeline::new(shared, chunk)
        .scan()
        .and_then(|scanned| scanned.reduce())
        .and_then(|reduced| reduced.scatter())
        .and_then(|scattered| scattered.assemble())
        .map_err(|e| e.offset_rows(first_row))?;

    info!(
        "Decoded chunk: {} rows, {} bytes, {} deferred, {:?}",
        rows,
        bytes,
        batch.fallback.len(),
        started.elapsed()
    );
    Ok(batch)
}
