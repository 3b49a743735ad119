//! Destination column buffers and the two-step sizing of variable-length
//! columns.

use arrow_buffer::{ArrowNativeType, MutableBuffer};
use tracing::debug;

use crate::allocator::{AllocationError, AllocationKind, DeviceBytes, Lease, MemoryManager};

/// Byte width of one Arrow `i32` offset.
pub const OFFSET_WIDTH: usize = std::mem::size_of::<i32>();

/// Storage class of a destination column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnLayout {
    /// `stride` bytes per row, sized from the row count alone.
    Fixed { stride: u32 },
    /// Offsets plus a value buffer sized by length reduction.
    Variable,
}

/// A device buffer that receives one column of a chunk.
#[derive(Debug)]
pub struct DestBuffer {
    /// Distance between consecutive rows, 0 for variable-length values.
    stride: u32,
    bytes: DeviceBytes,
}

impl DestBuffer {
    fn new(stride: u32, bytes: DeviceBytes) -> Self {
        Self { stride, bytes }
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Number of fixed-stride slots, 0 for variable-length values.
    pub fn slots(&self) -> usize {
        match self.stride {
            0 => 0,
            stride => self.bytes.len() / stride as usize,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.bytes.as_mut_slice()
    }

    pub fn typed<T: ArrowNativeType>(&self) -> &[T] {
        self.bytes.typed()
    }

    pub fn typed_mut<T: ArrowNativeType>(&mut self) -> &mut [T] {
        self.bytes.typed_mut()
    }

    /// Hand the storage over to its consumer. The lease must outlive every
    /// reader of the returned buffer for the budget to stay truthful.
    pub fn into_parts(self) -> (MutableBuffer, Lease) {
        self.bytes.into_parts()
    }
}

/// Offsets of a variable-length column whose value buffer is not allocated
/// yet.
#[derive(Debug)]
pub struct PendingVarlen {
    offsets: DestBuffer,
    manager: MemoryManager,
}

impl PendingVarlen {
    /// The `row_count + 1` offset slots.
    pub fn offsets_mut(&mut self) -> &mut [i32] {
        self.offsets.typed_mut()
    }

    pub fn offsets(&self) -> &DestBuffer {
        &self.offsets
    }

    /// Allocate the value buffer once the total byte count is known.
    pub fn resolve(self, total_bytes: usize) -> Result<VarlenBuffers, AllocationError> {
        let bytes = self
            .manager
            .allocate(AllocationKind::Variable, total_bytes)?;
        debug!("Resolved variable-length buffer of {} bytes", total_bytes);
        Ok(VarlenBuffers {
            offsets: self.offsets,
            values: DestBuffer::new(0, bytes),
        })
    }
}

/// Offsets and values of a fully sized variable-length column.
#[derive(Debug)]
pub struct VarlenBuffers {
    pub offsets: DestBuffer,
    pub values: DestBuffer,
}

/// Result of planning one column of a chunk.
#[derive(Debug)]
pub enum ColumnAllocation {
    Fixed(DestBuffer),
    Variable(PendingVarlen),
}

impl MemoryManager {
    /// Allocate every fixed-stride column of a chunk and the offset arrays of
    /// its variable-length columns in one serialized request.
    pub fn plan(
        &self,
        row_count: usize,
        layouts: &[ColumnLayout],
    ) -> Result<Vec<ColumnAllocation>, AllocationError> {
        let requests = layouts
            .iter()
            .map(|layout| match *layout {
                ColumnLayout::Fixed { stride } => row_count
                    .checked_mul(stride as usize)
                    .map(|bytes| (AllocationKind::Fixed, bytes))
                    .ok_or(AllocationError::SizeOverflow {
                        rows: row_count,
                        stride: stride as usize,
                    }),
                ColumnLayout::Variable => (row_count + 1)
                    .checked_mul(OFFSET_WIDTH)
                    .map(|bytes| (AllocationKind::Offsets, bytes))
                    .ok_or(AllocationError::SizeOverflow {
                        rows: row_count,
                        stride: OFFSET_WIDTH,
                    }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let leases = self.reserve_all(&requests)?;

        Ok(layouts
            .iter()
            .zip(leases)
            .map(|(layout, lease)| {
                let bytes = DeviceBytes::from_lease(lease);
                match *layout {
                    ColumnLayout::Fixed { stride } => {
                        ColumnAllocation::Fixed(DestBuffer::new(stride, bytes))
                    }
                    ColumnLayout::Variable => ColumnAllocation::Variable(PendingVarlen {
                        offsets: DestBuffer::new(OFFSET_WIDTH as u32, bytes),
                        manager: self.clone(),
                    }),
                }
            })
            .collect())
    }
}
