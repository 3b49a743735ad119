//! Decode PostgreSQL binary COPY streams into Arrow record batches on a
//! data-parallel device.
//!
//! ```text
//! COPY bytes -> CopyStream -> RawChunk -> scan -> reduce -> scatter -> RecordBatch
//!                                                               \-> fallback rows
//! ```
//!
//! Start with [`Decoder`] for synchronous use or [`StreamDecoder`] to overlap
//! chunks on a Tokio runtime.

pub use pg_gpu_core::{
    config, copy_stream, error, fallback, logging, pipeline, raw_chunk, stream, ChunkPipeline,
    CopyBatches, CopyHeader, CopyStream, DecodeError, DecodedBatch, Decoder, DecoderConfig,
    FallbackRow, RawChunk, ReferenceNumeric, StreamDecoder,
};

pub use arrow_interop::{oid, ArrowKind, ColumnMeta, TypeDefaults};
pub use gpu_decode_kernels::{DeferReason, LaunchConfig, RoundingMode};
pub use gpu_memory_manager::{AllocationError, MemoryManager, MemoryUsage};

/// Device kernels, for callers that drive the passes themselves.
pub mod kernels {
    pub use gpu_decode_kernels::*;
}
