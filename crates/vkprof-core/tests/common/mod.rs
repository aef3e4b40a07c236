//! Shared test harness: a simulated GPU that records timestamp writes per
//! command buffer and replays them against a monotonic clock on submit.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use vkprof_core::{DeviceProfiler, ProfilerConfig, SubmitInfo, TimestampBackend};
use vkprof_protocol::{Command, FrameData, RegionId, RegionKind, RegionTree};

pub const GRAPHICS_FAMILY: u32 = 0;
/// Queue family without timestamp support.
pub const TRANSFER_FAMILY: u32 = 1;

#[derive(Debug, Clone)]
enum GpuOp {
    Timestamp { pool: u64, query: u32 },
    Reset { pool: u64, first: u32, count: u32 },
    Work(u64),
    Execute(Vec<u64>),
}

#[derive(Default)]
struct GpuState {
    next_pool: u64,
    pools: HashMap<u64, Vec<Option<u64>>>,
    recorded: HashMap<u64, Vec<GpuOp>>,
    clock: u64,
    destroyed: usize,
    host_resets: usize,
    /// Timestamps written into queries that were still available.
    overwrites: usize,
}

pub struct SimulatedGpu {
    state: Mutex<GpuState>,
    fail_reads: AtomicBool,
}

impl SimulatedGpu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GpuState {
                next_pool: 0x1000,
                clock: 1000,
                ..Default::default()
            }),
            fail_reads: AtomicBool::new(false),
        })
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Forget everything recorded into `cb`, as `vkBeginCommandBuffer` does.
    pub fn begin_recording(&self, cb: vk::CommandBuffer) {
        self.state.lock().recorded.insert(cb.as_raw(), Vec::new());
    }

    pub fn record_work(&self, cb: vk::CommandBuffer, ticks: u64) {
        self.state
            .lock()
            .recorded
            .entry(cb.as_raw())
            .or_default()
            .push(GpuOp::Work(ticks));
    }

    pub fn record_execute(&self, cb: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        self.state
            .lock()
            .recorded
            .entry(cb.as_raw())
            .or_default()
            .push(GpuOp::Execute(secondaries.iter().map(|s| s.as_raw()).collect()));
    }

    /// Execute command buffers in order.
    pub fn run(&self, cbs: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cb in cbs {
            run_recorded(&mut state, cb.as_raw());
        }
    }

    pub fn timestamp_writes(&self, cb: vk::CommandBuffer) -> usize {
        self.state
            .lock()
            .recorded
            .get(&cb.as_raw())
            .map(|ops| ops.iter().filter(|op| matches!(op, GpuOp::Timestamp { .. })).count())
            .unwrap_or(0)
    }

    pub fn pools_created(&self) -> u64 {
        self.state.lock().next_pool - 0x1000
    }

    pub fn pools_destroyed(&self) -> usize {
        self.state.lock().destroyed
    }

    pub fn host_resets(&self) -> usize {
        self.state.lock().host_resets
    }

    pub fn overwrites(&self) -> usize {
        self.state.lock().overwrites
    }

    /// Whether every query pool `cb` writes into is reset in its own stream
    /// before the first write.
    pub fn resets_before_writes(&self, cb: vk::CommandBuffer) -> bool {
        let state = self.state.lock();
        let mut reset = std::collections::HashSet::new();
        state
            .recorded
            .get(&cb.as_raw())
            .map(|ops| {
                ops.iter().all(|op| match op {
                    GpuOp::Reset { pool, .. } => {
                        reset.insert(*pool);
                        true
                    }
                    GpuOp::Timestamp { pool, .. } => reset.contains(pool),
                    _ => true,
                })
            })
            .unwrap_or(false)
    }
}

fn run_recorded(state: &mut GpuState, cb: u64) {
    let ops = state.recorded.get(&cb).cloned().unwrap_or_default();
    for op in ops {
        match op {
            GpuOp::Timestamp { pool, query } => {
                state.clock += 1;
                let now = state.clock;
                if let Some(slot) = state
                    .pools
                    .get_mut(&pool)
                    .and_then(|p| p.get_mut(query as usize))
                {
                    let available = slot.replace(now).is_some();
                    if available {
                        state.overwrites += 1;
                    }
                }
            }
            GpuOp::Reset { pool, first, count } => {
                if let Some(queries) = state.pools.get_mut(&pool) {
                    for q in queries.iter_mut().skip(first as usize).take(count as usize) {
                        *q = None;
                    }
                }
            }
            GpuOp::Work(ticks) => state.clock += ticks,
            GpuOp::Execute(secondaries) => {
                for secondary in secondaries {
                    run_recorded(state, secondary);
                }
            }
        }
    }
}

impl TimestampBackend for SimulatedGpu {
    fn create_block(&self, size: u32) -> Result<vk::QueryPool, vk::Result> {
        let mut state = self.state.lock();
        let raw = state.next_pool;
        state.next_pool += 1;
        state.pools.insert(raw, vec![None; size as usize]);
        Ok(vk::QueryPool::from_raw(raw))
    }

    fn destroy_block(&self, pool: vk::QueryPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool.as_raw());
        state.destroyed += 1;
    }

    fn reset_block(&self, pool: vk::QueryPool, first: u32, count: u32) -> Result<(), vk::Result> {
        let mut state = self.state.lock();
        let queries = state
            .pools
            .get_mut(&pool.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        for q in queries.iter_mut().skip(first as usize).take(count as usize) {
            *q = None;
        }
        state.host_resets += 1;
        Ok(())
    }

    fn cmd_reset_block(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        self.state
            .lock()
            .recorded
            .entry(command_buffer.as_raw())
            .or_default()
            .push(GpuOp::Reset {
                pool: pool.as_raw(),
                first,
                count,
            });
    }

    fn write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        _stage: vk::PipelineStageFlags,
    ) {
        self.state
            .lock()
            .recorded
            .entry(command_buffer.as_raw())
            .or_default()
            .push(GpuOp::Timestamp {
                pool: pool.as_raw(),
                query,
            });
    }

    fn read_timestamps(&self, pool: vk::QueryPool, first: u32, out: &mut [u64]) -> Result<(), vk::Result> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let state = self.state.lock();
        let queries = state
            .pools
            .get(&pool.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        for (i, value) in out.iter_mut().enumerate() {
            *value = queries
                .get(first as usize + i)
                .copied()
                .flatten()
                .ok_or(vk::Result::NOT_READY)?;
        }
        Ok(())
    }

    fn timestamp_period_ns(&self) -> f64 {
        1.0
    }

    fn supports_timestamps(&self, queue_family: u32) -> bool {
        queue_family != TRANSFER_FAMILY
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub gpu: Arc<SimulatedGpu>,
    pub profiler: DeviceProfiler,
    pub pool: vk::CommandPool,
    pub transfer_pool: vk::CommandPool,
    pub queue: vk::Queue,
    next_handle: AtomicU64,
}

pub fn memory_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties {
        memory_heap_count: 2,
        memory_type_count: 2,
        ..Default::default()
    };
    props.memory_heaps[0].size = 1 << 30;
    props.memory_heaps[1].size = 1 << 28;
    props.memory_types[0].heap_index = 0;
    props.memory_types[1].heap_index = 1;
    props
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ProfilerConfig::default())
    }

    pub fn with_config(config: ProfilerConfig) -> Self {
        let gpu = SimulatedGpu::new();
        let backend: Arc<dyn TimestampBackend> = gpu.clone();
        let profiler = DeviceProfiler::new(config, backend, &memory_properties());
        let pool = vk::CommandPool::from_raw(0x10);
        let transfer_pool = vk::CommandPool::from_raw(0x11);
        profiler.create_command_pool(pool, GRAPHICS_FAMILY);
        profiler.create_command_pool(transfer_pool, TRANSFER_FAMILY);
        Self {
            gpu,
            profiler,
            pool,
            transfer_pool,
            queue: vk::Queue::from_raw(0x20),
            next_handle: AtomicU64::new(0x100),
        }
    }

    fn allocate(&self, pool: vk::CommandPool, level: vk::CommandBufferLevel) -> vk::CommandBuffer {
        let cb = vk::CommandBuffer::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.profiler.allocate_command_buffers(pool, level, &[cb]);
        cb
    }

    pub fn primary(&self) -> vk::CommandBuffer {
        self.allocate(self.pool, vk::CommandBufferLevel::PRIMARY)
    }

    pub fn secondary(&self) -> vk::CommandBuffer {
        self.allocate(self.pool, vk::CommandBufferLevel::SECONDARY)
    }

    pub fn transfer_primary(&self) -> vk::CommandBuffer {
        self.allocate(self.transfer_pool, vk::CommandBufferLevel::PRIMARY)
    }

    pub fn begin(&self, cb: vk::CommandBuffer) {
        self.gpu.begin_recording(cb);
        self.profiler
            .begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty());
    }

    pub fn begin_continue(&self, cb: vk::CommandBuffer) {
        self.gpu.begin_recording(cb);
        self.profiler
            .begin_command_buffer(cb, vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE);
    }

    pub fn end(&self, cb: vk::CommandBuffer) {
        self.profiler.end_command_buffer(cb);
    }

    pub fn begin_render_pass(&self, cb: vk::CommandBuffer, render_pass: u64) {
        self.profiler.begin_render_pass(
            cb,
            vk::RenderPass::from_raw(render_pass),
            vk::SubpassContents::INLINE,
        );
    }

    pub fn begin_render_pass_secondary(&self, cb: vk::CommandBuffer, render_pass: u64) {
        self.profiler.begin_render_pass(
            cb,
            vk::RenderPass::from_raw(render_pass),
            vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        );
    }

    pub fn bind_graphics(&self, cb: vk::CommandBuffer, pipeline: u64) {
        self.profiler.bind_pipeline(
            cb,
            vk::PipelineBindPoint::GRAPHICS,
            vk::Pipeline::from_raw(pipeline),
        );
    }

    pub fn bind_compute(&self, cb: vk::CommandBuffer, pipeline: u64) {
        self.profiler.bind_pipeline(
            cb,
            vk::PipelineBindPoint::COMPUTE,
            vk::Pipeline::from_raw(pipeline),
        );
    }

    /// Record a command that keeps the GPU busy for `ticks`.
    pub fn command(&self, cb: vk::CommandBuffer, command: Command, ticks: u64) {
        self.profiler.pre_command(cb, command);
        self.gpu.record_work(cb, ticks);
        self.profiler.post_command(cb);
    }

    pub fn draw(&self, cb: vk::CommandBuffer) {
        self.command(cb, draw(), 10);
    }

    pub fn dispatch(&self, cb: vk::CommandBuffer) {
        self.command(
            cb,
            Command::Dispatch {
                group_count_x: 8,
                group_count_y: 8,
                group_count_z: 1,
            },
            20,
        );
    }

    pub fn execute(&self, cb: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        self.profiler.execute_commands(cb, secondaries);
        self.gpu.record_execute(cb, secondaries);
        self.profiler.post_command(cb);
    }

    /// Submit `cbs` in one submit info and run them on the GPU.
    pub fn submit(&self, cbs: &[vk::CommandBuffer]) {
        self.profiler.queue_submit(
            self.queue,
            &[SubmitInfo {
                command_buffers: cbs,
                ..Default::default()
            }],
            vk::Fence::null(),
            vk::Result::SUCCESS,
        );
        self.gpu.run(cbs);
    }

    /// A primary with one render pass, one pipeline and `draws` draws.
    pub fn record_simple(&self, draws: usize) -> vk::CommandBuffer {
        let cb = self.primary();
        self.begin(cb);
        self.begin_render_pass(cb, 0xA0);
        self.bind_graphics(cb, 0xB0);
        for _ in 0..draws {
            self.draw(cb);
        }
        self.profiler.end_render_pass(cb);
        self.end(cb);
        cb
    }
}

pub fn draw() -> Command {
    Command::Draw {
        vertex_count: 3,
        instance_count: 1,
        first_vertex: 0,
        first_instance: 0,
    }
}

/// Kinds of the children of `id`, in order.
pub fn child_kinds(tree: &RegionTree, id: RegionId) -> Vec<RegionKind> {
    tree.children(id).map(|(_, node)| node.kind.clone()).collect()
}

/// Checks that every region with ticks lies within its parent and that
/// every parent's statistics equal the sum of its children's.
pub fn assert_tree_invariants(tree: &RegionTree) {
    for (index, node) in tree.nodes().iter().enumerate() {
        let id = RegionId(index as u32);
        let mut child_stats = vkprof_protocol::CommandStats::default();
        for (_, child) in tree.children(id) {
            child_stats += child.stats;
            if let (Some(parent), Some(inner)) = (node.ticks, child.ticks) {
                assert!(
                    parent.encloses(&inner),
                    "{:?} {:?} does not enclose {:?} {:?}",
                    node.kind,
                    parent,
                    child.kind,
                    inner
                );
            }
        }
        let own = match &node.kind {
            RegionKind::Command(cmd) => cmd.stats(),
            _ => Default::default(),
        };
        assert_eq!(node.stats, own + child_stats, "stats of {:?}", node.kind);
    }
}

pub fn assert_frame_invariants(frame: &FrameData) {
    for cb in frame.command_buffers() {
        assert_tree_invariants(&cb.tree);
    }
    let sum = frame.command_buffers().map(|cb| *cb.stats()).sum();
    assert_eq!(frame.stats, sum);
}
