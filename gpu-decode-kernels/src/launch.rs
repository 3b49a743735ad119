//! Kernel launch geometry and the data-parallel device that runs kernels.
//!
//! A kernel is a function of one logical thread index (a row). The device
//! groups threads into blocks of `threads_per_block`; when the grid would
//! exceed `max_blocks` each block strides over several block-sized spans,
//! like a grid-stride loop. `launch_*` returns only after every thread has
//! finished, which is the host-side barrier between passes.

use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::fmt;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_THREADS_PER_BLOCK: u32 = 256;
pub const DEFAULT_MAX_BLOCKS: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub threads_per_block: u32,
    pub max_blocks: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            threads_per_block: DEFAULT_THREADS_PER_BLOCK,
            max_blocks: DEFAULT_MAX_BLOCKS,
        }
    }
}

/// Grid and block size of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: u32,
    pub block: u32,
}

impl LaunchDims {
    /// Consecutive threads one block handles, including grid-stride spans.
    pub fn threads_per_grid_slot(&self, n_threads: usize) -> usize {
        let total = self.grid as usize * self.block as usize;
        let spans = n_threads.div_ceil(total.max(1)).max(1);
        spans * self.block as usize
    }
}

impl LaunchConfig {
    /// Grid for `n_threads` logical threads.
    pub fn dims(&self, n_threads: usize) -> LaunchDims {
        let block = self.threads_per_block.max(1);
        let blocks = n_threads.div_ceil(block as usize);
        let grid = blocks.clamp(1, self.max_blocks.max(1) as usize) as u32;
        LaunchDims { grid, block }
    }
}

/// A data-parallel executor with its own worker pool.
pub struct Device {
    name: String,
    pool: ThreadPool,
    launch: LaunchConfig,
}

impl Device {
    /// `worker_threads == 0` lets the pool pick one worker per core.
    pub fn new(
        name: impl Into<String>,
        launch: LaunchConfig,
        worker_threads: usize,
    ) -> Result<Self, ThreadPoolBuildError> {
        let name = name.into();
        let pool_name = name.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(move |i| format!("{}-sm{}", pool_name, i))
            .build()?;
        info!(
            "Device '{}': {} workers, {} threads/block, max {} blocks",
            name,
            pool.current_num_threads(),
            launch.threads_per_block,
            launch.max_blocks
        );
        Ok(Self { name, pool, launch })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn launch_config(&self) -> LaunchConfig {
        self.launch
    }

    /// Run host-side orchestration inside the device's pool, so nested
    /// launches and concurrent column kernels share its workers.
    pub fn run<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.pool.install(f)
    }

    fn span(&self, n_threads: usize) -> usize {
        self.launch.dims(n_threads).threads_per_grid_slot(n_threads)
    }

    /// One thread per `width`-element slot of `out`; thread `i` owns
    /// `out[i * width .. (i + 1) * width]`. A short tail forms the last slot.
    pub fn launch_slots<T, K>(&self, out: &mut [T], width: usize, kernel: K)
    where
        T: Send,
        K: Fn(usize, &mut [T]) + Sync + Send,
    {
        assert!(width > 0, "slot width must be non-zero");
        let n_threads = out.len().div_ceil(width);
        let span = self.span(n_threads);
        self.pool.install(|| {
            out.par_chunks_mut(width)
                .enumerate()
                .with_min_len(span)
                .for_each(|(i, slot)| kernel(i, slot));
        });
    }

    /// One thread per segment of `out`, segment `i` being
    /// `out[offsets[i] .. offsets[i + 1]]`. Offsets must be non-decreasing,
    /// start at 0 and end at `out.len()`.
    pub fn launch_segments<K>(&self, out: &mut [u8], offsets: &[i32], kernel: K)
    where
        K: Fn(usize, &mut [u8]) + Sync + Send,
    {
        let n_threads = offsets.len().saturating_sub(1);
        let mut segments = Vec::with_capacity(n_threads);
        let mut rest = out;
        for pair in offsets.windows(2) {
            let len = (pair[1] - pair[0]) as usize;
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            segments.push(head);
            rest = tail;
        }
        let span = self.span(n_threads);
        self.pool.install(|| {
            segments
                .into_par_iter()
                .enumerate()
                .with_min_len(span)
                .for_each(|(i, segment)| kernel(i, segment));
        });
    }

    /// One thread per index in `0..n_threads` with no owned output; threads
    /// publish through atomics.
    pub fn launch_indexed<K>(&self, n_threads: usize, kernel: K)
    where
        K: Fn(usize) + Sync + Send,
    {
        let span = self.span(n_threads);
        self.pool.install(|| {
            (0..n_threads)
                .into_par_iter()
                .with_min_len(span)
                .for_each(|i| kernel(i));
        });
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("workers", &self.pool.current_num_threads())
            .field("launch", &self.launch)
            .finish()
    }
}

/// Why a kernel thread gave up on its row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FaultKind {
    #[error("row holds {found} fields, expected {expected}")]
    FieldCount { found: i16, expected: usize },
    #[error("length prefix at byte {at} runs past the row end")]
    TruncatedPrefix { at: usize },
    #[error("field of {length} bytes at byte {at} runs past the row end")]
    FieldOutOfBounds { at: usize, length: i32 },
    #[error("invalid field length {0}")]
    InvalidLength(i32),
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),
    #[error("field holds {found} bytes, column width is {expected}")]
    WidthMismatch { found: i32, expected: u32 },
    #[error("field holds {found} bytes, its value segment has {expected}")]
    SegmentMismatch { found: usize, expected: usize },
    #[error("numeric field of {length} bytes does not match its header")]
    NumericLength { length: usize },
    #[error("numeric sign tag {0:#06x} is not recognised")]
    NumericSign(u16),
    #[error("numeric digit group {0} is not below 10000")]
    NumericDigit(u16),
}

/// A fault pinned to the row and column where it happened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row {row}, column {column}: {kind}")]
pub struct KernelFault {
    pub row: usize,
    pub column: usize,
    pub kind: FaultKind,
}

/// Device-side error slot. Threads record faults; the host reads the slot
/// after the barrier. The lowest `(row, column)` wins so repeated runs over
/// the same input report the same fault.
#[derive(Debug, Default)]
pub struct FaultSlot {
    first: Mutex<Option<KernelFault>>,
}

impl FaultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, fault: KernelFault) {
        let mut first = self.first.lock();
        let replace = match first.as_ref() {
            Some(current) => (fault.row, fault.column) < (current.row, current.column),
            None => true,
        };
        if replace {
            *first = Some(fault);
        }
    }

    pub fn into_result(self) -> Result<(), KernelFault> {
        match self.first.into_inner() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}
