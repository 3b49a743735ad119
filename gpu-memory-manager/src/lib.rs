pub mod allocator;
pub mod dest_buffer;
pub mod probe;

pub use allocator::{AllocationError, AllocationKind, DeviceBytes, Lease, MemoryManager, MemoryUsage};
pub use dest_buffer::{ColumnAllocation, ColumnLayout, DestBuffer, PendingVarlen, VarlenBuffers, OFFSET_WIDTH};
pub use probe::{resolve_budget, BudgetRequest};
