//! Memory allocation totals and resource binding intervals.
//!
//! Run with: cargo test --test memory_test

use ash::vk::{self, Handle};
use vkprof_core::{MemoryBindingIntervalTracker, MemoryTracker, ProfilerError, SparseResource};
use vkprof_protocol::{MemoryBindingInterval, ResourceKind};

mod common;
use common::Harness;

const PAGE: u64 = 0x10000;
const MEMORY: u64 = 0xE0;

fn interval(resource_offset: u64, size: u64, memory: u64, memory_offset: u64) -> MemoryBindingInterval {
    MemoryBindingInterval {
        resource_offset,
        size,
        memory,
        memory_offset,
    }
}

/// `pages` pages bound one by one, page `i` at memory offset `i * PAGE`.
fn paged(pages: u64, coalesce: bool) -> MemoryBindingIntervalTracker {
    let mut tracker = MemoryBindingIntervalTracker::new(coalesce);
    for i in 0..pages {
        tracker.bind(i * PAGE, PAGE, Some(MEMORY), i * PAGE);
    }
    tracker
}

#[test]
fn test_allocation_totals_return_to_zero() {
    let tracker = MemoryTracker::new(2, &[0, 1], false);
    for i in 0..4096u64 {
        tracker
            .allocate(0x1000 + i, (i % 2) as u32, 256)
            .expect("allocate");
    }
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.total_allocation_count, 4096);
    assert_eq!(snapshot.total_allocation_size, 4096 * 256);
    assert_eq!(snapshot.heaps[0].allocation_count, 2048);
    assert_eq!(snapshot.types[1].allocation_size, 2048 * 256);

    for i in 0..4096u64 {
        tracker.free(0x1000 + i).expect("free");
    }
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.total_allocation_count, 0);
    assert_eq!(snapshot.total_allocation_size, 0);
    assert!(snapshot
        .heaps
        .iter()
        .all(|h| h.allocation_count == 0 && h.allocation_size == 0));
    assert!(snapshot
        .types
        .iter()
        .all(|t| t.allocation_count == 0 && t.allocation_size == 0));
}

#[test]
fn test_types_attribute_to_their_heap() {
    let tracker = MemoryTracker::new(2, &[1, 0, 1], false);
    tracker.allocate(0x1, 0, 100).expect("allocate");
    tracker.allocate(0x2, 2, 50).expect("allocate");
    tracker.allocate(0x3, 1, 10).expect("allocate");

    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.heaps[1].allocation_size, 150);
    assert_eq!(snapshot.heaps[1].allocation_count, 2);
    assert_eq!(snapshot.heaps[0].allocation_size, 10);
    assert_eq!(snapshot.types[2].heap_index, 1);
}

#[test]
fn test_allocation_errors() {
    let tracker = MemoryTracker::new(1, &[0], false);
    assert!(matches!(
        tracker.allocate(0x1, 7, 64),
        Err(ProfilerError::InvalidMemoryType(7))
    ));
    assert!(matches!(
        tracker.free(0x99),
        Err(ProfilerError::UnknownAllocation(0x99))
    ));
    // Freeing VK_NULL_HANDLE is a no-op.
    tracker.free(0).expect("null free");
    assert_eq!(tracker.snapshot().total_allocation_count, 0);
}

#[test]
fn test_unbind_first_middle_and_last_page() {
    let mut tracker = paged(5, false);
    assert_eq!(tracker.len(), 5);

    tracker.bind(0, PAGE, None, 0);
    tracker.bind(2 * PAGE, PAGE, None, 0);
    tracker.bind(4 * PAGE, PAGE, None, 0);

    assert_eq!(
        tracker.intervals(),
        [
            interval(PAGE, PAGE, MEMORY, PAGE),
            interval(3 * PAGE, PAGE, MEMORY, 3 * PAGE),
        ]
    );
}

#[test]
fn test_unbind_last_two_pages() {
    let mut tracker = paged(8, false);
    tracker.bind(6 * PAGE, 2 * PAGE, None, 0);
    assert_eq!(tracker.len(), 6);
    assert_eq!(tracker.intervals().last().map(|b| b.resource_end()), Some(6 * PAGE));
}

#[test]
fn test_partial_overlap_splits_binding() {
    let mut tracker = MemoryBindingIntervalTracker::new(false);
    tracker.bind(0, 4 * PAGE, Some(0xA), 0x100);
    tracker.bind(PAGE, PAGE, Some(0xB), 0);

    assert_eq!(
        tracker.intervals(),
        [
            interval(0, PAGE, 0xA, 0x100),
            interval(PAGE, PAGE, 0xB, 0),
            interval(2 * PAGE, 2 * PAGE, 0xA, 0x100 + 2 * PAGE),
        ]
    );

    // Rebinding across the split replaces both halves.
    tracker.bind(PAGE / 2, 2 * PAGE, Some(0xC), 0);
    let intervals = tracker.intervals();
    assert_eq!(intervals.len(), 3);
    assert_eq!(intervals[0], interval(0, PAGE / 2, 0xA, 0x100));
    assert_eq!(intervals[1], interval(PAGE / 2, 2 * PAGE, 0xC, 0));
    assert_eq!(
        intervals[2],
        interval(PAGE / 2 + 2 * PAGE, PAGE + PAGE / 2, 0xA, 0x100 + PAGE / 2 + 2 * PAGE)
    );
    for pair in intervals.windows(2) {
        assert!(pair[0].resource_end() <= pair[1].resource_offset);
    }
}

#[test]
fn test_zero_sized_bind_is_ignored() {
    let mut tracker = paged(2, false);
    tracker.bind(0, 0, None, 0);
    assert_eq!(tracker.len(), 2);
}

#[test]
fn test_coalescing() {
    let tracker = paged(4, true);
    assert_eq!(tracker.intervals(), [interval(0, 4 * PAGE, MEMORY, 0)]);

    let mut tracker = tracker;
    tracker.bind(PAGE, PAGE, None, 0);
    assert_eq!(
        tracker.intervals(),
        [
            interval(0, PAGE, MEMORY, 0),
            interval(2 * PAGE, 2 * PAGE, MEMORY, 2 * PAGE),
        ]
    );

    // Rebinding the hole with contiguous memory merges all three again.
    tracker.bind(PAGE, PAGE, Some(MEMORY), PAGE);
    assert_eq!(tracker.intervals(), [interval(0, 4 * PAGE, MEMORY, 0)]);

    // Non-contiguous memory stays separate.
    let mut tracker = MemoryBindingIntervalTracker::new(true);
    tracker.bind(0, PAGE, Some(MEMORY), 0);
    tracker.bind(PAGE, PAGE, Some(MEMORY), 5 * PAGE);
    assert_eq!(tracker.len(), 2);
}

#[test]
fn test_memory_offsets_near_the_end_of_the_address_space() {
    let high = u64::MAX - PAGE;
    let mut tracker = MemoryBindingIntervalTracker::new(true);
    tracker.bind(0, 4 * PAGE, Some(MEMORY), high);

    // The tail past the hole would start beyond the last memory offset.
    tracker.bind(PAGE, PAGE, None, 0);
    assert_eq!(tracker.intervals(), [interval(0, PAGE, MEMORY, high)]);

    tracker.bind(PAGE, PAGE, Some(MEMORY), u64::MAX);
    assert_eq!(tracker.intervals(), [interval(0, 2 * PAGE, MEMORY, high)]);

    tracker.bind(2 * PAGE, PAGE, Some(MEMORY), 0);
    assert_eq!(tracker.len(), 2);
}

#[test]
fn test_profiler_resource_bindings() {
    let h = Harness::new();
    let memory = vk::DeviceMemory::from_raw(0x500);
    let buffer = vk::Buffer::from_raw(0x600);
    let image = vk::Image::from_raw(0x700);

    h.profiler.allocate_memory(memory, 0, 8 * PAGE);
    h.profiler.create_buffer(buffer, 2 * PAGE, false);
    h.profiler.bind_buffer_memory(buffer, memory, PAGE);

    h.profiler.create_image(image, 4 * PAGE, true);
    let binds: Vec<vk::SparseMemoryBind> = (0..4)
        .map(|i| vk::SparseMemoryBind {
            resource_offset: i * PAGE,
            size: PAGE,
            memory,
            memory_offset: (4 + i) * PAGE,
            ..Default::default()
        })
        .collect();
    h.profiler.bind_sparse(SparseResource::Image(image), &binds);
    h.profiler.bind_sparse(
        SparseResource::Image(image),
        &[vk::SparseMemoryBind {
            resource_offset: 3 * PAGE,
            size: PAGE,
            memory: vk::DeviceMemory::null(),
            ..Default::default()
        }],
    );

    let data = h.profiler.memory_data();
    assert_eq!(data.total_allocation_count, 1);
    assert_eq!(data.heaps[0].allocation_size, 8 * PAGE);

    let buffer_data = data.resource(0x600).expect("buffer");
    assert_eq!(buffer_data.kind, ResourceKind::Buffer);
    assert_eq!(buffer_data.bindings, [interval(0, 2 * PAGE, 0x500, PAGE)]);

    let image_data = data.resource(0x700).expect("image");
    assert!(image_data.sparse);
    assert_eq!(image_data.bindings.len(), 3);
    assert_eq!(image_data.bound_size(), 3 * PAGE);

    // Frames carry the memory snapshot taken at finalization.
    let frame = h.profiler.finish_frame();
    assert_eq!(frame.memory, data);

    h.profiler.destroy_image(image);
    h.profiler.free_memory(memory);
    let data = h.profiler.memory_data();
    assert!(data.resource(0x700).is_none());
    assert_eq!(data.total_allocation_count, 0);
}

#[test]
fn test_profiler_ignores_unknown_handles() {
    let h = Harness::new();
    h.profiler.free_memory(vk::DeviceMemory::from_raw(0x1));
    h.profiler
        .bind_buffer_memory(vk::Buffer::from_raw(0x2), vk::DeviceMemory::from_raw(0x3), 0);
    h.profiler.bind_sparse(SparseResource::Buffer(vk::Buffer::from_raw(0x4)), &[]);
    assert_eq!(h.profiler.memory_data().total_allocation_count, 0);
}
