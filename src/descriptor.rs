// Descriptor handle allocation
//
// A fixed-capacity, append-only allocator over one shader-visible descriptor
// table. Allocation is a single atomic fetch-add, so any number of threads can
// hand out slots concurrently; slots are never freed individually.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{BufferDescriptor, DescriptorLayout, GpuBackend};
use crate::error::{GpuError, GpuResult};

/// CPU-side handle of a descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub usize);

/// Shader-visible handle of a descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

/// One allocated slot: its index into the table and its CPU handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    pub index: u32,
    pub cpu: CpuDescriptorHandle,
}

/// Lock-free slot allocator. Knows nothing about the backend beyond the
/// table's layout.
pub struct DescriptorAllocator {
    layout: DescriptorLayout,
    // Monotonic; may run past capacity once exhausted
    cursor: AtomicU64,
}

impl DescriptorAllocator {
    pub fn new(layout: DescriptorLayout) -> Self {
        Self {
            layout,
            cursor: AtomicU64::new(0),
        }
    }

    /// Claim the next free slot.
    ///
    /// Each successful call returns a distinct index. Once `capacity` slots
    /// are handed out every further call fails with `OutOfCapacity` and the
    /// allocator stays exhausted.
    pub fn allocate(&self) -> GpuResult<DescriptorSlot> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        if index >= u64::from(self.layout.capacity) {
            return Err(GpuError::OutOfCapacity {
                capacity: self.layout.capacity,
            });
        }
        let index = index as u32;
        Ok(DescriptorSlot {
            index,
            cpu: self.cpu_handle(index),
        })
    }

    pub fn cpu_handle(&self, index: u32) -> CpuDescriptorHandle {
        CpuDescriptorHandle(self.layout.cpu_base + index as usize * self.layout.stride as usize)
    }

    /// Map a slot to the handle shaders use. Pure offset arithmetic.
    pub fn shader_visible(&self, slot: DescriptorSlot) -> GpuDescriptorHandle {
        GpuDescriptorHandle(self.layout.gpu_base + u64::from(slot.index) * u64::from(self.layout.stride))
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.cursor
            .load(Ordering::Relaxed)
            .min(u64::from(self.layout.capacity)) as u32
    }

    pub fn remaining(&self) -> u32 {
        self.capacity() - self.allocated()
    }

    pub fn layout(&self) -> DescriptorLayout {
        self.layout
    }
}

impl fmt::Debug for DescriptorAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorAllocator")
            .field("capacity", &self.layout.capacity)
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// The backend's descriptor table paired with its allocator
pub struct DescriptorHeap<B: GpuBackend> {
    backend: Arc<B>,
    table: B::DescriptorTable,
    allocator: DescriptorAllocator,
}

impl<B: GpuBackend> DescriptorHeap<B> {
    pub fn new(backend: Arc<B>, capacity: u32) -> GpuResult<Self> {
        let (table, layout) = backend.create_descriptor_table(capacity)?;
        log::info!(
            "Descriptor heap: {} slots, stride {} ({})",
            layout.capacity,
            layout.stride,
            backend.name()
        );
        Ok(Self {
            backend,
            table,
            allocator: DescriptorAllocator::new(layout),
        })
    }

    pub fn allocate(&self) -> GpuResult<DescriptorSlot> {
        let slot = self.allocator.allocate();
        if let Err(err) = &slot {
            log::error!("{}", err);
        }
        slot
    }

    pub fn shader_visible(&self, slot: DescriptorSlot) -> GpuDescriptorHandle {
        self.allocator.shader_visible(slot)
    }

    /// Point `slot` at a buffer view
    pub fn write_buffer(&self, slot: DescriptorSlot, descriptor: &BufferDescriptor<B>) -> GpuResult<()> {
        self.backend.write_descriptor(&self.table, slot.index, descriptor)
    }

    pub fn allocator(&self) -> &DescriptorAllocator {
        &self.allocator
    }

    pub fn table(&self) -> &B::DescriptorTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn layout(capacity: u32) -> DescriptorLayout {
        DescriptorLayout {
            capacity,
            stride: 32,
            cpu_base: 0x1000,
            gpu_base: 0x10_0000,
        }
    }

    #[test]
    fn concurrent_allocations_are_distinct_and_dense() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 128;
        let allocator = DescriptorAllocator::new(layout((THREADS * PER_THREAD) as u32));

        let mut indices: Vec<u32> = thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| allocator.allocate().unwrap().index)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        indices.sort_unstable();
        let expected: Vec<u32> = (0..(THREADS * PER_THREAD) as u32).collect();
        assert_eq!(indices, expected);
        assert_eq!(allocator.remaining(), 0);
    }

    #[test]
    fn exhaustion_is_sticky() {
        let allocator = DescriptorAllocator::new(layout(2));
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();

        for _ in 0..3 {
            assert!(matches!(
                allocator.allocate(),
                Err(GpuError::OutOfCapacity { capacity: 2 })
            ));
        }
        assert_eq!(allocator.allocated(), 2);
    }

    #[test]
    fn zero_capacity_never_allocates() {
        let allocator = DescriptorAllocator::new(layout(0));
        assert!(allocator.allocate().is_err());
        assert_eq!(allocator.remaining(), 0);
    }

    #[test]
    fn handles_are_linear_offsets_of_the_index() {
        let allocator = DescriptorAllocator::new(layout(8));
        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();

        assert_eq!(first.cpu, CpuDescriptorHandle(0x1000));
        assert_eq!(second.cpu, CpuDescriptorHandle(0x1000 + 32));
        assert_eq!(allocator.shader_visible(first), GpuDescriptorHandle(0x10_0000));
        assert_eq!(allocator.shader_visible(second), GpuDescriptorHandle(0x10_0000 + 32));
    }
}
