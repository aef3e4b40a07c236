//! GPU timestamp queries.
//!
//! Timestamps are handed out from fixed-size query pools ("blocks"). A
//! recording command buffer owns the blocks it writes into; submitted copies
//! of its record share them through `Arc`. A block goes back to the free list
//! only when its last holder lets go, which is after the frame that read it
//! has been resolved.
//!
//! Blocks are reset inside the command stream of the command buffer that
//! picks them up, so every execution starts from unavailable queries and a
//! command buffer can be resubmitted without being re-recorded. Resets are
//! not allowed inside a render pass instance; blocks picked up there are
//! reset on the host instead, and again after readback once no pending
//! submission holds them.

use std::collections::TryReserveError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::Mutex;

use crate::config::SamplingMode;
use crate::error::ProfilerError;

/// Device seam for timestamp queries.
pub trait TimestampBackend: Send + Sync {
    /// Create a query pool holding `size` timestamp queries.
    fn create_block(&self, size: u32) -> Result<vk::QueryPool, vk::Result>;

    fn destroy_block(&self, pool: vk::QueryPool);

    /// Host-side reset of `count` queries starting at `first`.
    fn reset_block(&self, pool: vk::QueryPool, first: u32, count: u32) -> Result<(), vk::Result>;

    /// Record a reset of `count` queries starting at `first` into
    /// `command_buffer`.
    fn cmd_reset_block(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);

    /// Record a timestamp write into `command_buffer`.
    fn write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        stage: vk::PipelineStageFlags,
    );

    /// Blocking read of `out.len()` results starting at `first`.
    fn read_timestamps(&self, pool: vk::QueryPool, first: u32, out: &mut [u64]) -> Result<(), vk::Result>;

    /// Length of one tick in nanoseconds.
    fn timestamp_period_ns(&self) -> f64;

    fn supports_timestamps(&self, queue_family: u32) -> bool;

    /// Current device tick, if the device can report one.
    fn calibration_tick(&self) -> Option<u64> {
        None
    }
}

/// Which level of the region hierarchy a timestamp brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    CommandBuffer,
    RenderPass,
    Pipeline,
    Command,
}

impl Granularity {
    pub fn sampled_by(self, mode: SamplingMode) -> bool {
        let finest = match mode {
            SamplingMode::Frame => Granularity::CommandBuffer,
            SamplingMode::RenderPass => Granularity::RenderPass,
            SamplingMode::Pipeline => Granularity::Pipeline,
            SamplingMode::Drawcall => Granularity::Command,
        };
        self <= finest
    }
}

/// A query slot inside one of a record's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySlot {
    /// Index into the owning record's block list.
    pub block: u32,
    pub index: u32,
}

/// How a block was brought into the unavailable state before first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReset {
    /// Reset recorded into the command buffer ahead of its first write.
    InStream,
    /// Reset on the host; needs another host reset before reuse.
    Host,
}

#[derive(Default)]
struct BlockPool {
    free: Mutex<Vec<vk::QueryPool>>,
    created: AtomicUsize,
}

/// One query pool on loan from the [`TimestampQueryManager`].
#[derive(Debug)]
pub struct QueryBlock {
    pool: vk::QueryPool,
    size: u32,
    home: Weak<BlockPool>,
    /// Submissions that will still be read back.
    pending: AtomicUsize,
}

impl QueryBlock {
    pub fn pool(&self) -> vk::QueryPool {
        self.pool
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn pending_submissions(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn submit(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one pending submission. Returns whether none is left.
    pub(crate) fn retire(&self) -> bool {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous <= 1
    }
}

impl Drop for QueryBlock {
    fn drop(&mut self) {
        // Query pools outliving the manager are reclaimed with the device.
        if let Some(home) = self.home.upgrade() {
            home.free.lock().push(self.pool);
        }
    }
}

/// A block together with how many of its queries a record wrote.
#[derive(Debug, Clone)]
pub struct BlockUse {
    pub block: Arc<QueryBlock>,
    pub used: u32,
    pub reset: BlockReset,
}

pub struct TimestampQueryManager {
    backend: Arc<dyn TimestampBackend>,
    blocks: Arc<BlockPool>,
    block_size: u32,
    period_ns: f64,
}

impl TimestampQueryManager {
    pub fn new(backend: Arc<dyn TimestampBackend>, block_size: u32) -> Self {
        let period_ns = backend.timestamp_period_ns();
        Self {
            backend,
            blocks: Arc::new(BlockPool::default()),
            block_size: block_size.max(2),
            period_ns,
        }
    }

    pub fn supports_queue_family(&self, queue_family: u32) -> bool {
        self.backend.supports_timestamps(queue_family)
    }

    pub fn timestamp_period_ns(&self) -> f64 {
        self.period_ns
    }

    pub fn calibration_tick(&self) -> Option<u64> {
        self.backend.calibration_tick()
    }

    /// Take a block from the free list, creating one if it is empty, and
    /// reset it the way `reset` says. In-stream resets are recorded into
    /// `command_buffer`.
    pub fn acquire_block(
        &self,
        command_buffer: vk::CommandBuffer,
        reset: BlockReset,
    ) -> Result<Arc<QueryBlock>, ProfilerError> {
        let recycled = self.blocks.free.lock().pop();
        let pool = match recycled {
            Some(pool) => pool,
            None => {
                let pool = self.backend.create_block(self.block_size)?;
                self.blocks.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("created timestamp query pool {:?}", pool);
                pool
            }
        };

        match reset {
            BlockReset::InStream => {
                self.backend
                    .cmd_reset_block(command_buffer, pool, 0, self.block_size)
            }
            BlockReset::Host => {
                if let Err(e) = self.backend.reset_block(pool, 0, self.block_size) {
                    self.blocks.free.lock().push(pool);
                    return Err(e.into());
                }
            }
        }

        Ok(Arc::new(QueryBlock {
            pool,
            size: self.block_size,
            home: Arc::downgrade(&self.blocks),
            pending: AtomicUsize::new(0),
        }))
    }

    pub fn write(
        &self,
        command_buffer: vk::CommandBuffer,
        block: &QueryBlock,
        index: u32,
        stage: vk::PipelineStageFlags,
    ) {
        self.backend
            .write_timestamp(command_buffer, block.pool, index, stage);
    }

    /// Blocking readback of every used query of `blocks`.
    pub fn resolve(&self, blocks: &[BlockUse]) -> Result<ResolvedTimestamps, vk::Result> {
        let mut values = Vec::with_capacity(blocks.len());
        for use_ in blocks {
            let mut ticks = vec![0u64; use_.used as usize];
            if !ticks.is_empty() {
                self.backend.read_timestamps(use_.block.pool, 0, &mut ticks)?;
            }
            values.push(ticks);
        }
        Ok(ResolvedTimestamps { values })
    }

    /// Retires one submission of a record's `blocks`. Host-reset blocks
    /// that no other pending submission holds are reset again, when the
    /// record was `read` back; in-stream blocks are reset by their next
    /// execution.
    pub fn retire_submission(&self, blocks: &[BlockUse], read: bool) {
        for use_ in blocks {
            let idle = use_.block.retire();
            if !(idle && read && use_.reset == BlockReset::Host) {
                continue;
            }
            if let Err(e) = self.backend.reset_block(use_.block.pool, 0, use_.block.size) {
                tracing::warn!("cannot reset query pool {:?}: {}", use_.block.pool, e);
            }
        }
    }

    pub fn free_block_count(&self) -> usize {
        self.blocks.free.lock().len()
    }

    pub fn created_block_count(&self) -> usize {
        self.blocks.created.load(Ordering::Relaxed)
    }
}

impl Drop for TimestampQueryManager {
    fn drop(&mut self) {
        for pool in self.blocks.free.lock().drain(..) {
            self.backend.destroy_block(pool);
        }
    }
}

/// Tick values of one record's blocks, indexed like the record's block list.
#[derive(Debug, Default)]
pub struct ResolvedTimestamps {
    values: Vec<Vec<u64>>,
}

impl ResolvedTimestamps {
    pub fn tick(&self, slot: QuerySlot) -> Option<u64> {
        self.values
            .get(slot.block as usize)?
            .get(slot.index as usize)
            .copied()
    }
}

/// Per-command-buffer timestamp allocator.
pub(crate) struct TimestampWriter {
    manager: Option<Arc<TimestampQueryManager>>,
    sampling: SamplingMode,
    command_buffer: vk::CommandBuffer,
    blocks: Vec<BlockUse>,
    /// Block this command buffer is currently writing into.
    current: Option<usize>,
    /// Writes land inside a render pass instance.
    in_render_pass: bool,
}

impl TimestampWriter {
    /// `manager` is `None` when the command buffer's queue family has no
    /// timestamp support.
    pub(crate) fn new(
        manager: Option<Arc<TimestampQueryManager>>,
        sampling: SamplingMode,
        command_buffer: vk::CommandBuffer,
    ) -> Self {
        Self {
            manager,
            sampling,
            command_buffer,
            blocks: Vec::new(),
            current: None,
            in_render_pass: false,
        }
    }

    pub(crate) fn set_in_render_pass(&mut self, inside: bool) {
        self.in_render_pass = inside;
    }

    /// Called outside a render pass right before one begins: switches to a
    /// fresh in-stream reset block when the current one is mostly used, so
    /// the render pass has room without host resets.
    pub(crate) fn preallocate(&mut self) {
        if self.in_render_pass
            || self.manager.is_none()
            || !Granularity::RenderPass.sampled_by(self.sampling)
        {
            return;
        }
        let mostly_used = match self.current {
            Some(i) => {
                let use_ = &self.blocks[i];
                use_.used.saturating_mul(5) >= use_.block.size().saturating_mul(4)
            }
            None => true,
        };
        if mostly_used {
            self.next_block();
        }
    }

    fn next_block(&mut self) -> Option<usize> {
        let manager = self.manager.clone()?;
        if let Err(e) = self.blocks.try_reserve(1) {
            tracing::warn!("skipping timestamp: {}", e);
            return None;
        }
        let reset = if self.in_render_pass {
            BlockReset::Host
        } else {
            BlockReset::InStream
        };
        let block = match manager.acquire_block(self.command_buffer, reset) {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!("skipping timestamp: {}", e);
                return None;
            }
        };
        self.blocks.push(BlockUse {
            block,
            used: 0,
            reset,
        });
        self.current = Some(self.blocks.len() - 1);
        self.current
    }

    /// Allocate a slot and record a timestamp write into it. Returns `None`
    /// when the region is not sampled or no slot could be allocated.
    pub(crate) fn write(&mut self, granularity: Granularity, stage: vk::PipelineStageFlags) -> Option<QuerySlot> {
        if self.manager.is_none() || !granularity.sampled_by(self.sampling) {
            return None;
        }

        let block_index = match self.current {
            Some(i) if self.blocks[i].used < self.blocks[i].block.size() => i,
            _ => self.next_block()?,
        };

        let manager = self.manager.as_ref()?;
        let use_ = &mut self.blocks[block_index];
        let index = use_.used;
        use_.used += 1;
        manager.write(self.command_buffer, &use_.block, index, stage);

        Some(QuerySlot {
            block: block_index as u32,
            index,
        })
    }

    /// Take shared ownership of another record's blocks. Returns the offset
    /// to add to that record's slot block indices.
    pub(crate) fn adopt(&mut self, blocks: &[BlockUse]) -> Result<u32, TryReserveError> {
        self.blocks.try_reserve(blocks.len())?;
        let offset = self.blocks.len() as u32;
        self.blocks.extend(blocks.iter().cloned());
        Ok(offset)
    }

    pub(crate) fn blocks(&self) -> &[BlockUse] {
        &self.blocks
    }

    /// Release every block; they recycle once no submitted copy holds them.
    pub(crate) fn reset(&mut self) {
        self.blocks.clear();
        self.current = None;
        self.in_render_pass = false;
    }
}

/// [`TimestampBackend`] over a real `ash::Device`.
///
/// Requires `hostQueryReset` (core in Vulkan 1.2) for blocks first used
/// inside a render pass.
pub struct AshTimestampBackend {
    device: ash::Device,
    period_ns: f64,
    families: Vec<vk::QueueFamilyProperties>,
}

impl AshTimestampBackend {
    pub fn new(
        device: ash::Device,
        properties: &vk::PhysicalDeviceProperties,
        queue_families: &[vk::QueueFamilyProperties],
    ) -> Self {
        Self {
            device,
            period_ns: properties.limits.timestamp_period as f64,
            families: queue_families.to_vec(),
        }
    }
}

impl TimestampBackend for AshTimestampBackend {
    fn create_block(&self, size: u32) -> Result<vk::QueryPool, vk::Result> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(size);
        // SAFETY: the device outlives the backend.
        unsafe { self.device.create_query_pool(&info, None) }
    }

    fn destroy_block(&self, pool: vk::QueryPool) {
        // SAFETY: pools reach here only from the free list, so no command
        // buffer references them.
        unsafe { self.device.destroy_query_pool(pool, None) }
    }

    fn reset_block(&self, pool: vk::QueryPool, first: u32, count: u32) -> Result<(), vk::Result> {
        // SAFETY: the pool is not in use by any pending command buffer.
        unsafe { self.device.reset_query_pool(pool, first, count) };
        Ok(())
    }

    fn cmd_reset_block(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        // SAFETY: recorded outside any render pass instance, on the thread
        // that owns `command_buffer`.
        unsafe {
            self.device
                .cmd_reset_query_pool(command_buffer, pool, first, count)
        }
    }

    fn write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        stage: vk::PipelineStageFlags,
    ) {
        // SAFETY: called from the intercepted recording call, on the thread
        // that owns `command_buffer`.
        unsafe {
            self.device
                .cmd_write_timestamp(command_buffer, stage, pool, query)
        }
    }

    fn read_timestamps(&self, pool: vk::QueryPool, first: u32, out: &mut [u64]) -> Result<(), vk::Result> {
        // SAFETY: `out` holds exactly the queries written by submitted work.
        unsafe {
            self.device.get_query_pool_results(
                pool,
                first,
                out,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
    }

    fn timestamp_period_ns(&self) -> f64 {
        self.period_ns
    }

    /// In-stream query resets need a graphics or compute queue.
    fn supports_timestamps(&self, queue_family: u32) -> bool {
        self.families.get(queue_family as usize).is_some_and(|family| {
            family.timestamp_valid_bits > 0
                && family
                    .queue_flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
    }
}
