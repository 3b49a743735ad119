use arrow_interop::AssembleError;
use arrow_schema::ArrowError;
use gpu_decode_kernels::{KernelFault, OffsetOverflow};
use gpu_memory_manager::AllocationError;
use thiserror::Error;

/// Why a chunk could not be decoded.
///
/// Row-level conditions (NULL, deferred numerics) are not errors; they show
/// up in the validity bitmaps and the fallback list of a decoded batch.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The chunk does not fit the device budget. Retry with fewer rows.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// A variable-length column exceeds i32 offsets. Retry with fewer rows.
    #[error(transparent)]
    OffsetOverflow(#[from] OffsetOverflow),

    /// `row` counts from the first row of the COPY stream.
    #[error("malformed data at row {row}, column {column}: {detail}")]
    Malformed {
        row: usize,
        column: usize,
        detail: String,
    },

    #[error("invalid COPY header: {0}")]
    Header(String),

    #[error("COPY flags {0:#010x} are not supported")]
    UnsupportedFlags(i32),

    /// A buffer disagrees with its column metadata. Always a bug.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

impl DecodeError {
    /// Whether a smaller chunk may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Allocation(_) | Self::OffsetOverflow(_))
    }

    /// Move a chunk-relative row position to the stream position of a
    /// chunk starting at `first_row`.
    pub(crate) fn offset_rows(self, first_row: usize) -> Self {
        match self {
            Self::Malformed { row, column, detail } => Self::Malformed {
                row: row + first_row,
                column,
                detail,
            },
            other => other,
        }
    }
}

impl From<KernelFault> for DecodeError {
    fn from(fault: KernelFault) -> Self {
        Self::Malformed {
            row: fault.row,
            column: fault.column,
            detail: fault.kind.to_string(),
        }
    }
}

impl From<AssembleError> for DecodeError {
    fn from(err: AssembleError) -> Self {
        match err {
            AssembleError::Arrow(e) => Self::Arrow(e),
            invariant @ AssembleError::Invariant { .. } => Self::Invariant(invariant.to_string()),
        }
    }
}
