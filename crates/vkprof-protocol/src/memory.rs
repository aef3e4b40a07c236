use serde::{Deserialize, Serialize};

/// One contiguous range of a resource backed by device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct MemoryBindingInterval {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: u64,
    pub memory_offset: u64,
}

impl MemoryBindingInterval {
    pub fn resource_end(&self) -> u64 {
        self.resource_offset + self.size
    }

    pub fn memory_end(&self) -> u64 {
        self.memory_offset + self.size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct HeapMemoryData {
    pub allocation_count: u64,
    pub allocation_size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct MemoryTypeData {
    pub heap_index: u32,
    pub allocation_count: u64,
    pub allocation_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ResourceKind {
    Buffer,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ResourceMemoryData {
    pub handle: u64,
    pub kind: ResourceKind,
    pub size: u64,
    pub sparse: bool,
    /// Ordered by resource offset, pairwise disjoint.
    pub bindings: Vec<MemoryBindingInterval>,
}

impl ResourceMemoryData {
    pub fn bound_size(&self) -> u64 {
        self.bindings.iter().map(|b| b.size).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct MemoryData {
    pub total_allocation_count: u64,
    pub total_allocation_size: u64,
    pub heaps: Vec<HeapMemoryData>,
    pub types: Vec<MemoryTypeData>,
    /// Sorted by handle.
    pub resources: Vec<ResourceMemoryData>,
}

impl MemoryData {
    pub fn resource(&self, handle: u64) -> Option<&ResourceMemoryData> {
        self.resources
            .binary_search_by_key(&handle, |r| r.handle)
            .ok()
            .map(|i| &self.resources[i])
    }
}
