//! Host driver of the binary COPY decode pipeline.
//!
//! A [`Decoder`] owns the emulated device, the memory manager and the
//! per-column metadata. Chunks go through [`pipeline::ChunkPipeline`] one
//! stage at a time; [`stream::StreamDecoder`] overlaps several chunks.

use anyhow::{bail, Context, Result};
use arrow_interop::{ColumnMeta, SchemaExt};
use arrow_schema::SchemaRef;
use bytes::Bytes;
use gpu_decode_kernels::{
    DecimalKernel, Device, FieldTable, ReduceKernel, RoundingMode, ScanKernel, ScatterKernel,
};
use gpu_memory_manager::{resolve_budget, MemoryManager};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

pub mod config;
pub mod copy_stream;
pub mod error;
pub mod fallback;
pub mod logging;
pub mod pipeline;
pub mod raw_chunk;
pub mod stream;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::DecoderConfig;
pub use copy_stream::{CopyHeader, CopyStream};
pub use error::DecodeError;
pub use fallback::{FallbackRow, ReferenceNumeric};
pub use pipeline::{ChunkPipeline, DecodedBatch};
pub use raw_chunk::RawChunk;
pub use stream::StreamDecoder;

/// Assumed average size of a variable-length value when sizing chunks.
const VARLEN_SIZE_GUESS: usize = 32;

/// State every chunk pipeline of one decoder shares.
pub(crate) struct DecoderShared {
    pub(crate) device: Arc<Device>,
    pub(crate) memory: MemoryManager,
    pub(crate) metas: Vec<ColumnMeta>,
    pub(crate) schema: SchemaRef,
    pub(crate) rounding: RoundingMode,
    pub(crate) scan: ScanKernel,
    pub(crate) reduce: ReduceKernel,
    pub(crate) scatter: ScatterKernel,
    pub(crate) decimal: DecimalKernel,
}

/// Decodes binary COPY rows of a fixed column list into Arrow batches.
///
/// Cloning is cheap and clones share the device and memory budget.
#[derive(Clone)]
pub struct Decoder {
    shared: Arc<DecoderShared>,
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(config: DecoderConfig, metas: Vec<ColumnMeta>) -> Result<Self> {
        config.validate()?;
        let budget = resolve_budget(&config.budget_request())?;
        Self::with_memory(config, metas, MemoryManager::new(budget))
    }

    /// Build a decoder that draws from an existing memory manager.
    pub fn with_memory(
        config: DecoderConfig,
        metas: Vec<ColumnMeta>,
        memory: MemoryManager,
    ) -> Result<Self> {
        config.validate()?;
        if metas.is_empty() {
            bail!("A decoder needs at least one column");
        }
        if metas.len() > i16::MAX as usize {
            bail!("{} columns exceed the COPY field count limit", metas.len());
        }
        metas.validate_all()?;

        let device = Arc::new(
            Device::new(
                "pgcopy",
                config.launch_config(),
                config.device.worker_threads,
            )
            .context("Failed to start the device worker pool")?,
        );
        let schema = metas.to_arrow_schema();

        info!(
            "Decoder ready: {} columns ({} variable-length), budget {} bytes",
            metas.len(),
            metas.variable_columns().len(),
            memory.budget()
        );

        Ok(Self {
            shared: Arc::new(DecoderShared {
                scan: ScanKernel::new(device.clone()),
                reduce: ReduceKernel::new(device.clone()),
                scatter: ScatterKernel::new(device.clone()),
                decimal: DecimalKernel::new(device.clone()),
                device,
                memory,
                metas,
                schema,
                rounding: config.decode.rounding,
            }),
            config,
        })
    }

    /// Columns resolved from `(name, type oid, typmod)` triples, with the
    /// config's defaults for unconstrained numerics.
    pub fn for_wire_types(config: DecoderConfig, columns: &[(&str, u32, i32)]) -> Result<Self> {
        let defaults = config.type_defaults();
        let metas = columns
            .iter()
            .map(|&(name, oid, typmod)| ColumnMeta::from_pg_type(name, oid, typmod, &defaults))
            .collect();
        Self::new(config, metas)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn schema(&self) -> SchemaRef {
        self.shared.schema.clone()
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.shared.metas
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.shared.memory
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    /// Run one chunk through every stage. Nothing is retried.
    pub fn decode_chunk(&self, chunk: RawChunk) -> Result<DecodedBatch, DecodeError> {
        pipeline::decode_chunk(self.shared.clone(), chunk)
    }

    /// Like [`Decoder::decode_chunk`], but a chunk that does not fit the
    /// budget is split in halves and retried. Returns one batch per piece
    /// that went through.
    ///
    /// Splitting stops as soon as the free budget cannot hold even the
    /// smallest row of the chunk, since no piece could succeed then.
    pub fn decode_chunk_split(&self, chunk: RawChunk) -> Result<Vec<DecodedBatch>, DecodeError> {
        let mut out = Vec::new();
        let mut pending = vec![chunk];
        while let Some(chunk) = pending.pop() {
            let rows = chunk.row_count();
            match self.decode_chunk(chunk.clone()) {
                Ok(batch) => out.push(batch),
                Err(e) if e.is_retryable() && rows > 1 && self.single_row_fits(&chunk) => {
                    warn!(
                        "Chunk of {} rows did not fit ({}, {} bytes held by live batches); splitting",
                        rows,
                        e,
                        self.shared.memory.usage().held_by_columns()
                    );
                    let (head, tail) = chunk.split_at_row(rows / 2);
                    pending.push(tail);
                    pending.push(head);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Rows per chunk that fit the currently free budget, capped by the
    /// configured chunk size.
    pub fn rows_per_chunk(&self) -> usize {
        let per_row = self.shared.metas.device_bytes_per_row(VARLEN_SIZE_GUESS);
        self.shared
            .memory
            .suggest_rows_per_chunk(per_row, self.config.decode.rows_per_chunk)
    }

    /// Decode a COPY payload lazily, one framed chunk per step.
    ///
    /// Header errors surface here; everything else comes out of the
    /// iterator, which stops after the first error. Dropping each batch
    /// before pulling the next keeps a payload of any size within budget.
    pub fn decode_iter(&self, data: Bytes) -> Result<CopyBatches, DecodeError> {
        Ok(CopyBatches {
            decoder: self.clone(),
            chunks: CopyStream::new(data, self.rows_per_chunk())?,
            ready: VecDeque::new(),
            done: false,
        })
    }

    /// Decode a complete COPY payload into batches in row order.
    ///
    /// Every batch is alive at once, so the whole payload has to fit the
    /// budget; use [`Decoder::decode_iter`] for larger ones.
    pub fn decode_copy(&self, data: Bytes) -> Result<Vec<DecodedBatch>, DecodeError> {
        self.decode_iter(data)?.collect()
    }

    pub(crate) fn shared(&self) -> Arc<DecoderShared> {
        self.shared.clone()
    }

    /// Cheap host check of the first row, so a stream for another table
    /// fails before any device work.
    pub(crate) fn check_field_count(&self, chunk: &RawChunk) -> Result<(), DecodeError> {
        let Some(count) = gpu_decode_kernels::wire::read_i16(chunk.row(0), 0) else {
            return Ok(());
        };
        if count as usize != self.shared.metas.len() {
            return Err(DecodeError::Malformed {
                row: chunk.first_row(),
                column: 0,
                detail: format!(
                    "row has {} fields, expected {}",
                    count,
                    self.shared.metas.len()
                ),
            });
        }
        Ok(())
    }

    /// Lower bound of what any one-row piece of `chunk` reserves, against
    /// the budget that is free right now.
    fn single_row_fits(&self, chunk: &RawChunk) -> bool {
        let smallest = (0..chunk.row_count())
            .map(|r| chunk.row(r).len())
            .min()
            .unwrap_or_default();
        let needed = smallest + FieldTable::size_for(1, self.shared.metas.len());
        needed <= self.shared.memory.usage().available()
    }
}

/// Batches of one COPY payload, decoded as they are pulled.
///
/// Returned by [`Decoder::decode_iter`].
pub struct CopyBatches {
    decoder: Decoder,
    chunks: CopyStream,
    /// Pieces of a split chunk not handed out yet.
    ready: VecDeque<DecodedBatch>,
    done: bool,
}

impl CopyBatches {
    pub fn header(&self) -> &CopyHeader {
        self.chunks.header()
    }

    /// Rows framed so far, including those still queued.
    pub fn rows_seen(&self) -> usize {
        self.chunks.rows_seen()
    }

    fn fail(&mut self, e: DecodeError) -> Option<Result<DecodedBatch, DecodeError>> {
        self.done = true;
        self.ready.clear();
        Some(Err(e))
    }
}

impl Iterator for CopyBatches {
    type Item = Result<DecodedBatch, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = self.ready.pop_front() {
                return Some(Ok(batch));
            }
            if self.done {
                return None;
            }
            let chunk = match self.chunks.next()? {
                Ok(chunk) => chunk,
                Err(e) => return self.fail(e),
            };
            let decoded = self
                .decoder
                .check_field_count(&chunk)
                .and_then(|()| self.decoder.decode_chunk_split(chunk));
            match decoded {
                Ok(batches) => self.ready.extend(batches),
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl std::fmt::Debug for CopyBatches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyBatches")
            .field("rows_seen", &self.chunks.rows_seen())
            .field("ready", &self.ready.len())
            .field("done", &self.done)
            .finish()
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("columns", &self.shared.metas.len())
            .field("device", &self.shared.device)
            .field("memory", &self.shared.memory)
            .finish()
    }
}
