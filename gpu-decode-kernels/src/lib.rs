//! Data-parallel kernels of the COPY decode pipeline.
//!
//! | Pass | Kernel | One thread per |
//! |------|--------|----------------|
//! | 1 | [`ScanKernel`] | row |
//! | reduce | [`ReduceKernel`] | block of rows, per variable-length column |
//! | 2 | [`ScatterKernel`] | row, per fixed or variable-length column |
//! | 2 | [`DecimalKernel`] | row, per `numeric` column |
//!
//! Kernels never allocate destination memory. They write into buffers the
//! memory manager handed out and report malformed rows through a
//! [`KernelFault`] once the launch has finished.

pub mod decimal_kernel;
pub mod launch;
pub mod reduce_kernel;
pub mod scan_kernel;
pub mod scatter_kernel;
pub mod wide;
pub mod wire;

pub use decimal_kernel::{
    decode_numeric, DecimalKernel, DecimalScatterParams, DecimalTarget, DeferReason,
    NumericOutcome, RoundingMode, DECIMAL_WIDTH,
};
pub use launch::{Device, FaultKind, FaultSlot, KernelFault, LaunchConfig, LaunchDims};
pub use reduce_kernel::{OffsetOverflow, ReduceKernel};
pub use scan_kernel::{FieldDescriptor, FieldTable, ScanKernel, ScanOutput, ScanParams};
pub use scatter_kernel::{FixedScatterParams, ScatterKernel};
pub use wide::WideInt;
