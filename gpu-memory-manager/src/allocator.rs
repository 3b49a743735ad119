use arrow_buffer::{ArrowNativeType, MutableBuffer};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Allocation failures reported by the [`MemoryManager`].
///
/// Both variants are recoverable: the caller is expected to shrink its chunk
/// and try again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("device memory exhausted: requested {requested} bytes, {available} of {budget} available")]
    Exhausted {
        requested: usize,
        available: usize,
        budget: usize,
    },
    #[error("allocation size overflows: {rows} rows x {stride} bytes")]
    SizeOverflow { rows: usize, stride: usize },
}

/// What an allocation is used for. Only used for bookkeeping and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Fixed-stride destination column (including Decimal128).
    Fixed,
    /// Offsets of a variable-length column.
    Offsets,
    /// Values of a variable-length column, sized after length reduction.
    Variable,
    /// Per-chunk working memory such as the field descriptor table.
    Scratch,
}

/// Snapshot of the manager's capacity bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub budget: usize,
    pub in_use: usize,
    pub peak: usize,
    pub live_allocations: usize,
    /// Part of `in_use` held as [`AllocationKind::Scratch`].
    pub scratch: usize,
}

impl MemoryUsage {
    pub fn available(&self) -> usize {
        self.budget.saturating_sub(self.in_use)
    }

    /// Bytes held by finished columns: destination, offset and value
    /// buffers that are still alive.
    pub fn held_by_columns(&self) -> usize {
        self.in_use.saturating_sub(self.scratch)
    }
}

struct Ledger {
    in_use: usize,
    peak: usize,
}

struct Inner {
    budget: usize,
    // Every capacity change goes through this lock, which serializes
    // allocation requests coming from overlapping chunk pipelines.
    ledger: Mutex<Ledger>,
    live: DashMap<u64, (AllocationKind, usize)>,
    next_id: AtomicU64,
}

impl Inner {
    fn release(&self, id: u64, bytes: usize) {
        let mut ledger = self.ledger.lock();
        ledger.in_use = ledger.in_use.saturating_sub(bytes);
        drop(ledger);
        self.live.remove(&id);
    }
}

/// Owns the device memory budget and hands out accounted allocations.
///
/// Cloning is cheap; all clones share one ledger.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl MemoryManager {
    pub fn new(budget: usize) -> Self {
        info!("Initializing device memory manager");
        info!("  Budget: {} bytes", budget);

        Self {
            inner: Arc::new(Inner {
                budget,
                ledger: Mutex::new(Ledger { in_use: 0, peak: 0 }),
                live: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn budget(&self) -> usize {
        self.inner.budget
    }

    pub fn usage(&self) -> MemoryUsage {
        let scratch = self
            .inner
            .live
            .iter()
            .filter(|entry| entry.value().0 == AllocationKind::Scratch)
            .map(|entry| entry.value().1)
            .sum();
        let ledger = self.inner.ledger.lock();
        MemoryUsage {
            budget: self.inner.budget,
            in_use: ledger.in_use,
            peak: ledger.peak,
            live_allocations: self.inner.live.len(),
            scratch,
        }
    }

    /// Reserve `bytes` of device capacity without materializing a buffer.
    pub fn reserve(&self, kind: AllocationKind, bytes: usize) -> Result<Lease, AllocationError> {
        let mut leases = self.reserve_all(&[(kind, bytes)])?;
        Ok(leases.remove(0))
    }

    /// Reserve several allocations as one request: either all of them fit or
    /// none is taken.
    pub fn reserve_all(
        &self,
        requests: &[(AllocationKind, usize)],
    ) -> Result<Vec<Lease>, AllocationError> {
        let total = requests
            .iter()
            .try_fold(0usize, |acc, (_, bytes)| acc.checked_add(*bytes));

        {
            let mut ledger = self.inner.ledger.lock();
            let available = self.inner.budget.saturating_sub(ledger.in_use);
            let total = match total {
                Some(total) if total <= available => total,
                _ => {
                    let requested = total.unwrap_or(usize::MAX);
                    warn!(
                        "Allocation of {} bytes refused ({} of {} available)",
                        requested, available, self.inner.budget
                    );
                    return Err(AllocationError::Exhausted {
                        requested,
                        available,
                        budget: self.inner.budget,
                    });
                }
            };
            ledger.in_use += total;
            ledger.peak = ledger.peak.max(ledger.in_use);
        }

        let total = total.unwrap_or_default();
        let leases = requests
            .iter()
            .map(|&(kind, bytes)| {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                self.inner.live.insert(id, (kind, bytes));
                Lease {
                    id,
                    bytes,
                    kind,
                    inner: Arc::clone(&self.inner),
                }
            })
            .collect();

        debug!("Reserved {} bytes in {} allocation(s)", total, requests.len());
        Ok(leases)
    }

    /// Allocate a zero-filled device buffer of `bytes` bytes.
    pub fn allocate(
        &self,
        kind: AllocationKind,
        bytes: usize,
    ) -> Result<DeviceBytes, AllocationError> {
        let lease = self.reserve(kind, bytes)?;
        Ok(DeviceBytes::from_lease(lease))
    }

    /// Largest row count whose working set fits in half of the capacity
    /// currently available, clamped to `[1, max_rows]`.
    pub fn suggest_rows_per_chunk(&self, bytes_per_row: usize, max_rows: usize) -> usize {
        let available = self.usage().available() / 2;
        let rows = available / bytes_per_row.max(1);
        rows.clamp(1, max_rows.max(1))
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("usage", &self.usage())
            .finish()
    }
}

/// An accounted slice of the device budget, returned to the ledger on drop.
pub struct Lease {
    id: u64,
    bytes: usize,
    kind: AllocationKind,
    inner: Arc<Inner>,
}

impl Lease {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("bytes", &self.bytes)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.release(self.id, self.bytes);
    }
}

/// Zero-initialized device memory together with its lease.
///
/// The storage is 64-byte aligned so it can be handed to Arrow as a typed
/// buffer without copying.
#[derive(Debug)]
pub struct DeviceBytes {
    data: MutableBuffer,
    lease: Lease,
}

impl DeviceBytes {
    pub(crate) fn from_lease(lease: Lease) -> Self {
        Self {
            data: MutableBuffer::from_len_zeroed(lease.bytes()),
            lease,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_slice_mut()
    }

    /// View as native values. Panics if the length is not a multiple of
    /// `size_of::<T>()`.
    pub fn typed<T: ArrowNativeType>(&self) -> &[T] {
        self.data.typed_data()
    }

    pub fn typed_mut<T: ArrowNativeType>(&mut self) -> &mut [T] {
        self.data.typed_data_mut()
    }

    pub fn into_parts(self) -> (MutableBuffer, Lease) {
        (self.data, self.lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release_updates_ledger() {
        let manager = MemoryManager::new(1024);
        let lease = manager.reserve(AllocationKind::Fixed, 600).unwrap();
        assert_eq!(manager.usage().in_use, 600);
        assert_eq!(manager.usage().live_allocations, 1);

        drop(lease);
        let usage = manager.usage();
        assert_eq!(usage.in_use, 0);
        assert_eq!(usage.peak, 600);
        assert_eq!(usage.live_allocations, 0);
    }

    #[test]
    fn test_exhaustion_is_reported_not_panicked() {
        let manager = MemoryManager::new(100);
        let _held = manager.reserve(AllocationKind::Scratch, 80).unwrap();
        let err = manager.reserve(AllocationKind::Fixed, 40).unwrap_err();
        assert_eq!(
            err,
            AllocationError::Exhausted {
                requested: 40,
                available: 20,
                budget: 100
            }
        );
    }

    #[test]
    fn test_reserve_all_is_all_or_nothing() {
        let manager = MemoryManager::new(100);
        let result = manager.reserve_all(&[
            (AllocationKind::Fixed, 60),
            (AllocationKind::Offsets, 60),
        ]);
        assert!(result.is_err());
        assert_eq!(manager.usage().in_use, 0);
    }

    #[test]
    fn test_allocations_are_zeroed_and_aligned() {
        let manager = MemoryManager::new(4096);
        let bytes = manager.allocate(AllocationKind::Fixed, 160).unwrap();
        assert_eq!(bytes.len(), 160);
        assert!(bytes.as_slice().iter().all(|&b| b == 0));
        assert_eq!(bytes.as_slice().as_ptr() as usize % 16, 0);
    }

    #[test]
    fn test_suggested_rows_are_clamped() {
        let manager = MemoryManager::new(1000);
        assert_eq!(manager.suggest_rows_per_chunk(10, 1_000_000), 50);
        assert_eq!(manager.suggest_rows_per_chunk(10, 20), 20);
        assert_eq!(manager.suggest_rows_per_chunk(10_000, 20), 1);
    }

    #[test]
    fn test_usage_splits_scratch_from_columns() {
        let manager = MemoryManager::new(1000);
        let scratch = manager.reserve(AllocationKind::Scratch, 300).unwrap();
        let _column = manager.allocate(AllocationKind::Fixed, 200).unwrap();
        let _offsets = manager.reserve(AllocationKind::Offsets, 40).unwrap();

        let usage = manager.usage();
        assert_eq!(usage.scratch, 300);
        assert_eq!(usage.held_by_columns(), 240);

        drop(scratch);
        let usage = manager.usage();
        assert_eq!(usage.scratch, 0);
        assert_eq!(usage.held_by_columns(), 240);
    }
}
