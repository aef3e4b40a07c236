//! Device memory bookkeeping: allocation totals per heap and memory type,
//! and the current memory bindings of every tracked buffer and image.

use std::collections::BTreeMap;

use ash::vk::{self, Handle};
use dashmap::DashMap;
use parking_lot::Mutex;
use vkprof_protocol::{
    HeapMemoryData, MemoryBindingInterval, MemoryData, MemoryTypeData, ResourceKind,
    ResourceMemoryData,
};

use crate::error::ProfilerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    size: u64,
    memory: u64,
    memory_offset: u64,
}

/// Disjoint set of `[resource_offset, resource_offset + size)` ranges of one
/// resource, each mapped to a range of device memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBindingIntervalTracker {
    /// Keyed by resource offset.
    intervals: BTreeMap<u64, Binding>,
    coalesce: bool,
}

impl MemoryBindingIntervalTracker {
    pub fn new(coalesce: bool) -> Self {
        Self {
            intervals: BTreeMap::new(),
            coalesce,
        }
    }

    /// Bind `[offset, offset + size)` to `memory` at `memory_offset`, or
    /// unbind the range when `memory` is `None`. Whatever was bound in the
    /// range before is trimmed away first.
    pub fn bind(&mut self, offset: u64, size: u64, memory: Option<u64>, memory_offset: u64) {
        if size == 0 {
            return;
        }
        let end = offset.saturating_add(size);
        self.unbind_range(offset, end);

        let Some(memory) = memory else {
            return;
        };
        let mut offset = offset;
        let mut binding = Binding {
            size: end - offset,
            memory,
            memory_offset,
        };

        if self.coalesce {
            if let Some((&prev_offset, &prev)) = self.intervals.range(..offset).next_back() {
                if prev_offset + prev.size == offset
                    && prev.memory == memory
                    && prev.memory_offset.checked_add(prev.size) == Some(memory_offset)
                {
                    self.intervals.remove(&prev_offset);
                    offset = prev_offset;
                    binding.size += prev.size;
                    binding.memory_offset = prev.memory_offset;
                }
            }
            if let Some(&next) = self.intervals.get(&end) {
                if next.memory == memory
                    && binding.memory_offset.checked_add(binding.size) == Some(next.memory_offset)
                {
                    self.intervals.remove(&end);
                    binding.size += next.size;
                }
            }
        }

        self.intervals.insert(offset, binding);
    }

    fn unbind_range(&mut self, offset: u64, end: u64) {
        // Intervals are disjoint, so scanning back from `end` can stop at the
        // first interval that ends at or before `offset`.
        let overlapping: Vec<u64> = self
            .intervals
            .range(..end)
            .rev()
            .take_while(|&(&start, b)| start + b.size > offset)
            .map(|(&start, _)| start)
            .collect();

        for start in overlapping {
            let Some(old) = self.intervals.remove(&start) else {
                continue;
            };
            let old_end = start + old.size;
            if start < offset {
                self.intervals.insert(
                    start,
                    Binding {
                        size: offset - start,
                        ..old
                    },
                );
            }
            if old_end > end {
                match old.memory_offset.checked_add(end - start) {
                    Some(memory_offset) => {
                        self.intervals.insert(
                            end,
                            Binding {
                                size: old_end - end,
                                memory: old.memory,
                                memory_offset,
                            },
                        );
                    }
                    None => tracing::warn!(
                        "dropping binding tail at {:#x}: memory offset overflows",
                        end
                    ),
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Current bindings ordered by resource offset.
    pub fn intervals(&self) -> Vec<MemoryBindingInterval> {
        self.intervals
            .iter()
            .map(|(&resource_offset, b)| MemoryBindingInterval {
                resource_offset,
                size: b.size,
                memory: b.memory,
                memory_offset: b.memory_offset,
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Totals {
    allocation_count: u64,
    allocation_size: u64,
    heaps: Vec<HeapMemoryData>,
    types: Vec<MemoryTypeData>,
}

#[derive(Debug)]
struct Allocation {
    type_index: u32,
    size: u64,
}

#[derive(Debug)]
struct TrackedResource {
    kind: ResourceKind,
    size: u64,
    sparse: bool,
    bindings: MemoryBindingIntervalTracker,
}

/// Per-device memory model.
pub struct MemoryTracker {
    totals: Mutex<Totals>,
    allocations: DashMap<u64, Allocation>,
    resources: DashMap<u64, TrackedResource>,
    coalesce: bool,
}

impl MemoryTracker {
    /// `type_heaps[i]` is the heap index of memory type `i`.
    pub fn new(heap_count: usize, type_heaps: &[u32], coalesce: bool) -> Self {
        let totals = Totals {
            heaps: vec![HeapMemoryData::default(); heap_count],
            types: type_heaps
                .iter()
                .map(|&heap_index| MemoryTypeData {
                    heap_index,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        Self {
            totals: Mutex::new(totals),
            allocations: DashMap::new(),
            resources: DashMap::new(),
            coalesce,
        }
    }

    pub fn from_properties(properties: &vk::PhysicalDeviceMemoryProperties, coalesce: bool) -> Self {
        let type_count = (properties.memory_type_count as usize).min(properties.memory_types.len());
        let heap_count = (properties.memory_heap_count as usize).min(properties.memory_heaps.len());
        let type_heaps: Vec<u32> = properties.memory_types[..type_count]
            .iter()
            .map(|t| t.heap_index)
            .collect();
        Self::new(heap_count, &type_heaps, coalesce)
    }

    pub fn allocate(&self, memory: u64, type_index: u32, size: u64) -> Result<(), ProfilerError> {
        let mut totals = self.totals.lock();
        let heap_index = totals
            .types
            .get(type_index as usize)
            .map(|t| t.heap_index as usize)
            .ok_or(ProfilerError::InvalidMemoryType(type_index))?;

        totals.allocation_count += 1;
        totals.allocation_size = totals.allocation_size.saturating_add(size);
        if let Some(ty) = totals.types.get_mut(type_index as usize) {
            ty.allocation_count += 1;
            ty.allocation_size = ty.allocation_size.saturating_add(size);
        }
        if let Some(heap) = totals.heaps.get_mut(heap_index) {
            heap.allocation_count += 1;
            heap.allocation_size = heap.allocation_size.saturating_add(size);
        }
        drop(totals);

        self.allocations.insert(memory, Allocation { type_index, size });
        Ok(())
    }

    pub fn free(&self, memory: u64) -> Result<(), ProfilerError> {
        if memory == 0 {
            return Ok(());
        }
        let (_, allocation) = self
            .allocations
            .remove(&memory)
            .ok_or(ProfilerError::UnknownAllocation(memory))?;

        let mut totals = self.totals.lock();
        totals.allocation_count = totals.allocation_count.saturating_sub(1);
        totals.allocation_size = totals.allocation_size.saturating_sub(allocation.size);
        let heap_index = totals.types.get(allocation.type_index as usize).map(|t| t.heap_index);
        if let Some(ty) = totals.types.get_mut(allocation.type_index as usize) {
            ty.allocation_count = ty.allocation_count.saturating_sub(1);
            ty.allocation_size = ty.allocation_size.saturating_sub(allocation.size);
        }
        if let Some(heap) = heap_index.and_then(|i| totals.heaps.get_mut(i as usize)) {
            heap.allocation_count = heap.allocation_count.saturating_sub(1);
            heap.allocation_size = heap.allocation_size.saturating_sub(allocation.size);
        }
        Ok(())
    }

    pub fn register_resource(&self, handle: u64, kind: ResourceKind, size: u64, sparse: bool) {
        self.resources.insert(
            handle,
            TrackedResource {
                kind,
                size,
                sparse,
                bindings: MemoryBindingIntervalTracker::new(self.coalesce),
            },
        );
    }

    pub fn unregister_resource(&self, handle: u64) {
        self.resources.remove(&handle);
    }

    /// Non-sparse binding: the whole resource is backed by `memory`.
    pub fn bind_resource(&self, handle: u64, memory: u64, memory_offset: u64) -> Result<(), ProfilerError> {
        let mut resource = self
            .resources
            .get_mut(&handle)
            .ok_or(ProfilerError::UnknownResource(handle))?;
        let size = resource.size;
        resource.bindings.clear();
        resource.bindings.bind(0, size, Some(memory), memory_offset);
        Ok(())
    }

    /// Sparse (re)binding of resource ranges. A null memory handle unbinds.
    pub fn bind_sparse(&self, handle: u64, binds: &[vk::SparseMemoryBind]) -> Result<(), ProfilerError> {
        let mut resource = self
            .resources
            .get_mut(&handle)
            .ok_or(ProfilerError::UnknownResource(handle))?;
        for bind in binds {
            let memory = (bind.memory != vk::DeviceMemory::null()).then(|| bind.memory.as_raw());
            resource
                .bindings
                .bind(bind.resource_offset, bind.size, memory, bind.memory_offset);
        }
        Ok(())
    }

    /// Size the resource was created with.
    pub fn resource_size(&self, handle: u64) -> Option<u64> {
        self.resources.get(&handle).map(|r| r.size)
    }

    pub fn bindings(&self, handle: u64) -> Option<Vec<MemoryBindingInterval>> {
        self.resources.get(&handle).map(|r| r.bindings.intervals())
    }

    pub fn snapshot(&self) -> MemoryData {
        let totals = self.totals.lock();
        let mut resources: Vec<ResourceMemoryData> = self
            .resources
            .iter()
            .map(|entry| ResourceMemoryData {
                handle: *entry.key(),
                kind: entry.kind,
                size: entry.size,
                sparse: entry.sparse,
                bindings: entry.bindings.intervals(),
            })
            .collect();
        resources.sort_by_key(|r| r.handle);

        MemoryData {
            total_allocation_count: totals.allocation_count,
            total_allocation_size: totals.allocation_size,
            heaps: totals.heaps.clone(),
            types: totals.types.clone(),
            resources,
        }
    }
}
