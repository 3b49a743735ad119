//! Column metadata and the Arrow side of the decode pipeline.
//!
//! # Layout contract
//!
//! Every destination column is an Arrow-compatible buffer written in place by
//! the device kernels:
//!
//! ```text
//! fixed:    [ value[0] | value[1] | ... | value[n-1] ]        stride = width
//! decimal:  [ i128 LE  | i128 LE  | ... ]                     stride = 16
//! variable: offsets [o0 .. on] (i32)  +  values [bytes ...]
//! ```
//!
//! Null bitmaps are packed LSB-first, exactly as Arrow expects, so assembly
//! hands buffers over without touching values.

pub mod batch_assembler;
pub mod bitmap;
pub mod column_meta;
pub mod schema_utils;

pub use batch_assembler::{assemble_batch, AssembleError, AssembledBatch, ColumnBuffers, FinishedColumn};
pub use bitmap::{AtomicBitmap, Bitmap, NullBitmap, OverflowMask};
pub use column_meta::{
    numeric_typmod, oid, ArrowKind, ColumnClass, ColumnMeta, FixedTransform, TypeDefaults,
};
pub use schema_utils::SchemaExt;
