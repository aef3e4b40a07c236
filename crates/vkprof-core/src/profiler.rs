//! Per-device profiler context.
//!
//! Every intercepted call on a device is routed to its [`DeviceProfiler`].
//! Entry points never fail: profiler-internal errors are logged and the
//! intercepted call proceeds unaffected.

use std::sync::Arc;
use std::time::Instant;

use ash::vk::{self, Handle};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use vkprof_protocol::{
    label_color, Command, CommandBufferLevel, FrameData, MemoryData, PartialReason,
    PipelineBindPoint, ResourceKind, SubpassContents, WHOLE_SIZE,
};

use crate::aggregator::{FrameDataAggregator, InProgressFrame};
use crate::command_buffer::{CommandBufferRecord, CommandBufferTracker, RecordingState};
use crate::config::{FrameDelimiter, ProfilerConfig};
use crate::error::ProfilerError;
use crate::memory::MemoryTracker;
use crate::submission::{QueueSubmissionTracker, SubmitInfo};
use crate::timestamp::{TimestampBackend, TimestampQueryManager};
use crate::trace::TraceFileWriter;

/// Target of a sparse binding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

impl SparseResource {
    fn raw(self) -> u64 {
        match self {
            SparseResource::Buffer(buffer) => buffer.as_raw(),
            SparseResource::Image(image) => image.as_raw(),
        }
    }
}

#[derive(Debug)]
struct CommandPoolState {
    queue_family: u32,
    command_buffers: Vec<vk::CommandBuffer>,
}

type SharedTracker = Arc<Mutex<CommandBufferTracker>>;

pub struct DeviceProfiler {
    config: ProfilerConfig,
    timestamps: Arc<TimestampQueryManager>,
    command_pools: DashMap<vk::CommandPool, CommandPoolState>,
    /// Each tracker is only ever locked by the thread recording it, so the
    /// lock is uncontended.
    command_buffers: DashMap<vk::CommandBuffer, SharedTracker>,
    submissions: QueueSubmissionTracker,
    frame: Mutex<InProgressFrame>,
    /// Serializes finalization so frames publish in index order.
    finalize: Mutex<()>,
    aggregator: FrameDataAggregator,
    memory: MemoryTracker,
    frame_delimiter: RwLock<FrameDelimiter>,
    trace: Option<Mutex<TraceFileWriter>>,
}

fn report(op: &str, result: Result<(), ProfilerError>) {
    if let Err(e) = result {
        tracing::warn!("{}: {}", op, e);
    }
}

fn command_buffer_level(level: vk::CommandBufferLevel) -> CommandBufferLevel {
    if level == vk::CommandBufferLevel::SECONDARY {
        CommandBufferLevel::Secondary
    } else {
        CommandBufferLevel::Primary
    }
}

fn subpass_contents(contents: vk::SubpassContents) -> SubpassContents {
    match contents {
        vk::SubpassContents::INLINE => SubpassContents::Inline,
        vk::SubpassContents::SECONDARY_COMMAND_BUFFERS => SubpassContents::SecondaryCommandBuffers,
        _ => SubpassContents::InlineAndSecondaryCommandBuffers,
    }
}

fn pipeline_bind_point(bind_point: vk::PipelineBindPoint) -> Option<PipelineBindPoint> {
    match bind_point {
        vk::PipelineBindPoint::GRAPHICS => Some(PipelineBindPoint::Graphics),
        vk::PipelineBindPoint::COMPUTE => Some(PipelineBindPoint::Compute),
        vk::PipelineBindPoint::RAY_TRACING_KHR => Some(PipelineBindPoint::RayTracing),
        _ => None,
    }
}

impl DeviceProfiler {
    pub fn new(
        config: ProfilerConfig,
        backend: Arc<dyn TimestampBackend>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        let epoch = Instant::now();
        let timestamps = Arc::new(TimestampQueryManager::new(
            backend,
            config.profiler.query_block_size,
        ));
        let aggregator = FrameDataAggregator::new(
            Arc::clone(&timestamps),
            config.profiler.frame_count as usize,
            config.profiler.overflow_policy,
            config.profiler.max_frame_count as usize,
            epoch,
        );
        let memory =
            MemoryTracker::from_properties(memory_properties, config.memory.coalesce_sparse_bindings);

        let trace = config.output.trace_path.as_deref().and_then(|path| {
            match TraceFileWriter::create(path, config.output.compress) {
                Ok(writer) => {
                    tracing::info!("writing trace to {}", path);
                    Some(Mutex::new(writer))
                }
                Err(e) => {
                    tracing::warn!("cannot open trace file {}: {}", path, e);
                    None
                }
            }
        });

        tracing::debug!(
            "device profiler created: delimiter={:?} sampling={:?} frames={}",
            config.profiler.frame_delimiter,
            config.profiler.sampling_mode,
            config.profiler.frame_count
        );

        Self {
            frame_delimiter: RwLock::new(config.profiler.frame_delimiter),
            timestamps,
            command_pools: DashMap::new(),
            command_buffers: DashMap::new(),
            submissions: QueueSubmissionTracker::new(epoch),
            frame: Mutex::new(InProgressFrame::new(0, 0)),
            finalize: Mutex::new(()),
            aggregator,
            memory,
            trace,
            config,
        }
    }

    /// Profiler configured from `vkprof.toml` and `VKPROF_*` variables, with
    /// logging initialized unless the host process already did so.
    pub fn from_env(
        backend: Arc<dyn TimestampBackend>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        vkprof_common::try_init_logging();
        Self::new(ProfilerConfig::from_env(), backend, memory_properties)
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn timestamps(&self) -> &TimestampQueryManager {
        &self.timestamps
    }

    fn tracker(&self, command_buffer: vk::CommandBuffer) -> Result<SharedTracker, ProfilerError> {
        self.command_buffers
            .get(&command_buffer)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ProfilerError::UnknownCommandBuffer(command_buffer.as_raw()))
    }

    fn with_tracker(
        &self,
        op: &str,
        command_buffer: vk::CommandBuffer,
        f: impl FnOnce(&mut CommandBufferTracker) -> Result<(), ProfilerError>,
    ) {
        let result = self
            .tracker(command_buffer)
            .and_then(|tracker| f(&mut tracker.lock()));
        report(op, result);
    }

    /// Run `f` with the in-progress frame locked.
    fn with_frame<R>(&self, f: impl FnOnce(&mut InProgressFrame) -> R) -> R {
        f(&mut self.frame.lock())
    }

    fn snapshot(&self, command_buffer: vk::CommandBuffer) -> Result<CommandBufferRecord, ProfilerError> {
        self.tracker(command_buffer)?.lock().snapshot()
    }

    pub fn command_buffer_state(&self, command_buffer: vk::CommandBuffer) -> Option<RecordingState> {
        self.tracker(command_buffer).ok().map(|t| t.lock().state())
    }

    // ── Command pools and buffers ───────────────────────────

    pub fn create_command_pool(&self, pool: vk::CommandPool, queue_family: u32) {
        self.command_pools.insert(
            pool,
            CommandPoolState {
                queue_family,
                command_buffers: Vec::new(),
            },
        );
    }

    pub fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if let Some((_, state)) = self.command_pools.remove(&pool) {
            for command_buffer in state.command_buffers {
                self.command_buffers.remove(&command_buffer);
            }
        }
    }

    pub fn reset_command_pool(&self, pool: vk::CommandPool) {
        let buffers = self
            .command_pools
            .get(&pool)
            .map(|state| state.command_buffers.clone())
            .unwrap_or_default();
        for command_buffer in buffers {
            if let Ok(tracker) = self.tracker(command_buffer) {
                tracker.lock().reset();
            }
        }
    }

    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        command_buffers: &[vk::CommandBuffer],
    ) {
        let queue_family = match self.command_pools.get(&pool) {
            Some(state) => state.queue_family,
            None => {
                tracing::warn!("unknown command pool {:#x}, assuming queue family 0", pool.as_raw());
                self.create_command_pool(pool, 0);
                0
            }
        };
        let timestamps = self
            .timestamps
            .supports_queue_family(queue_family)
            .then(|| Arc::clone(&self.timestamps));
        if timestamps.is_none() {
            tracing::debug!("queue family {} has no timestamps; structure only", queue_family);
        }

        let level = command_buffer_level(level);
        for &command_buffer in command_buffers {
            let tracker = CommandBufferTracker::new(
                command_buffer,
                level,
                timestamps.clone(),
                self.config.profiler.sampling_mode,
            );
            self.command_buffers
                .insert(command_buffer, Arc::new(Mutex::new(tracker)));
        }
        if let Some(mut state) = self.command_pools.get_mut(&pool) {
            state.command_buffers.extend_from_slice(command_buffers);
        }
    }

    pub fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        for command_buffer in command_buffers {
            self.command_buffers.remove(command_buffer);
        }
        if let Some(mut state) = self.command_pools.get_mut(&pool) {
            state
                .command_buffers
                .retain(|cb| !command_buffers.contains(cb));
        }
    }

    pub fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, usage: vk::CommandBufferUsageFlags) {
        let render_pass_continue = usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE);
        self.with_tracker("vkBeginCommandBuffer", command_buffer, |t| t.begin(render_pass_continue));
    }

    pub fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.with_tracker("vkEndCommandBuffer", command_buffer, |t| t.end());
    }

    pub fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.with_tracker("vkResetCommandBuffer", command_buffer, |t| {
            t.reset();
            Ok(())
        });
    }

    // ── Recording ───────────────────────────────────────────

    pub fn begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        contents: vk::SubpassContents,
    ) {
        self.with_tracker("vkCmdBeginRenderPass", command_buffer, |t| {
            t.begin_render_pass(render_pass, subpass_contents(contents))
        });
    }

    pub fn next_subpass(&self, command_buffer: vk::CommandBuffer, contents: vk::SubpassContents) {
        self.with_tracker("vkCmdNextSubpass", command_buffer, |t| {
            t.next_subpass(subpass_contents(contents))
        });
    }

    pub fn end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.with_tracker("vkCmdEndRenderPass", command_buffer, |t| t.end_render_pass());
    }

    pub fn begin_rendering(&self, command_buffer: vk::CommandBuffer, flags: vk::RenderingFlags) {
        let contents = if flags.contains(vk::RenderingFlags::CONTENTS_SECONDARY_COMMAND_BUFFERS) {
            SubpassContents::SecondaryCommandBuffers
        } else {
            SubpassContents::Inline
        };
        self.with_tracker("vkCmdBeginRendering", command_buffer, |t| t.begin_rendering(contents));
    }

    pub fn end_rendering(&self, command_buffer: vk::CommandBuffer) {
        self.with_tracker("vkCmdEndRendering", command_buffer, |t| t.end_rendering());
    }

    pub fn bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        let Some(bind_point) = pipeline_bind_point(bind_point) else {
            tracing::debug!("ignoring pipeline bind point {:?}", bind_point);
            return;
        };
        self.with_tracker("vkCmdBindPipeline", command_buffer, |t| {
            t.bind_pipeline(bind_point, pipeline)
        });
    }

    /// Pre-command hook of `vkCmdExecuteCommands`; close it with
    /// [`post_command`](Self::post_command).
    pub fn execute_commands(&self, command_buffer: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        // Secondaries are snapshotted before the primary is locked.
        let mut records = Vec::with_capacity(secondaries.len());
        for &secondary in secondaries {
            match self.snapshot(secondary) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("vkCmdExecuteCommands: skipping secondary: {}", e),
            }
        }
        self.with_tracker("vkCmdExecuteCommands", command_buffer, |t| {
            t.execute_commands(&records)
        });
    }

    pub fn pre_command(&self, command_buffer: vk::CommandBuffer, command: Command) {
        let command = self.resolve_whole_size(command);
        let op = command.name();
        self.with_tracker(op, command_buffer, |t| t.pre_command(command));
    }

    /// Replaces `VK_WHOLE_SIZE` in a fill with the remaining size of the
    /// buffer, when the buffer is tracked.
    fn resolve_whole_size(&self, command: Command) -> Command {
        match command {
            Command::FillBuffer {
                buffer,
                offset,
                size: WHOLE_SIZE,
                data,
            } => {
                let size = self
                    .memory
                    .resource_size(buffer)
                    .map(|total| total.saturating_sub(offset))
                    .unwrap_or(WHOLE_SIZE);
                Command::FillBuffer {
                    buffer,
                    offset,
                    size,
                    data,
                }
            }
            command => command,
        }
    }

    // ── Debug utils labels ──────────────────────────────────

    pub fn begin_debug_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        let command = Command::BeginDebugLabel {
            name: name.to_owned(),
            color: label_color(color),
        };
        self.with_tracker("vkCmdBeginDebugUtilsLabelEXT", command_buffer, |t| t.debug_label(command));
    }

    /// Labels begun in an earlier command buffer of the same submission may
    /// be closed here.
    pub fn end_debug_label(&self, command_buffer: vk::CommandBuffer) {
        self.with_tracker("vkCmdEndDebugUtilsLabelEXT", command_buffer, |t| {
            t.debug_label(Command::EndDebugLabel)
        });
    }

    pub fn insert_debug_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        let command = Command::InsertDebugLabel {
            name: name.to_owned(),
            color: label_color(color),
        };
        self.with_tracker("vkCmdInsertDebugUtilsLabelEXT", command_buffer, |t| t.debug_label(command));
    }

    pub fn post_command(&self, command_buffer: vk::CommandBuffer) {
        self.with_tracker("post-command", command_buffer, |t| t.post_command());
    }

    // ── Memory ──────────────────────────────────────────────

    pub fn allocate_memory(&self, memory: vk::DeviceMemory, memory_type_index: u32, size: u64) {
        report(
            "vkAllocateMemory",
            self.memory.allocate(memory.as_raw(), memory_type_index, size),
        );
    }

    pub fn free_memory(&self, memory: vk::DeviceMemory) {
        report("vkFreeMemory", self.memory.free(memory.as_raw()));
    }

    pub fn create_buffer(&self, buffer: vk::Buffer, size: u64, sparse: bool) {
        self.memory
            .register_resource(buffer.as_raw(), ResourceKind::Buffer, size, sparse);
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.memory.unregister_resource(buffer.as_raw());
    }

    /// `size` is the image's memory requirement.
    pub fn create_image(&self, image: vk::Image, size: u64, sparse: bool) {
        self.memory
            .register_resource(image.as_raw(), ResourceKind::Image, size, sparse);
    }

    pub fn destroy_image(&self, image: vk::Image) {
        self.memory.unregister_resource(image.as_raw());
    }

    pub fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: u64) {
        report(
            "vkBindBufferMemory",
            self.memory
                .bind_resource(buffer.as_raw(), memory.as_raw(), offset),
        );
    }

    pub fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: u64) {
        report(
            "vkBindImageMemory",
            self.memory
                .bind_resource(image.as_raw(), memory.as_raw(), offset),
        );
    }

    pub fn bind_sparse(&self, resource: SparseResource, binds: &[vk::SparseMemoryBind]) {
        report(
            "vkQueueBindSparse",
            self.memory.bind_sparse(resource.raw(), binds),
        );
    }

    pub fn memory_data(&self) -> MemoryData {
        self.memory.snapshot()
    }

    // ── Queues ──────────────────────────────────────────────

    /// Called after the real submission returned `result`. A failed
    /// submission publishes the current frame as partial.
    pub fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo<'_>],
        fence: vk::Fence,
        result: vk::Result,
    ) {
        if result != vk::Result::SUCCESS {
            let reason = if result == vk::Result::ERROR_DEVICE_LOST {
                PartialReason::DeviceLost
            } else {
                PartialReason::SubmissionFailed
            };
            tracing::warn!("vkQueueSubmit failed with {}; publishing partial frame", result);
            self.publish_frame(Some(reason));
            return;
        }

        let batch = self
            .submissions
            .build_batch(queue, submits, fence, |cb| self.snapshot(cb));
        self.with_frame(|frame| self.submissions.append(frame, batch));
    }

    /// Called after the real present returned `result`.
    pub fn queue_present(&self, queue: vk::Queue, result: vk::Result) {
        if result == vk::Result::ERROR_DEVICE_LOST {
            self.device_lost();
            return;
        }
        tracing::trace!("present on queue {:#x}: {}", queue.as_raw(), result);
        if self.frame_delimiter() == FrameDelimiter::Present {
            self.finish_frame();
        }
    }

    /// Publish whatever the current frame holds, marked partial.
    pub fn device_lost(&self) {
        tracing::warn!("device lost; publishing partial frame");
        self.publish_frame(Some(PartialReason::DeviceLost));
    }

    // ── Consumers ───────────────────────────────────────────

    /// Latest published frame, or `None` before the first publication.
    pub fn get_data(&self) -> Option<Arc<FrameData>> {
        self.aggregator.latest()
    }

    /// Every retained frame, oldest first.
    pub fn frames(&self) -> Vec<Arc<FrameData>> {
        self.aggregator.frames()
    }

    /// End the current frame and publish it, even when it is empty.
    pub fn finish_frame(&self) -> Arc<FrameData> {
        self.publish_frame(None)
    }

    pub fn set_min_data_buffer_size(&self, frames: usize) {
        self.aggregator.set_capacity(frames);
    }

    pub fn data_buffer_size(&self) -> usize {
        self.aggregator.capacity()
    }

    pub fn set_frame_delimiter(&self, delimiter: FrameDelimiter) {
        *self.frame_delimiter.write() = delimiter;
    }

    pub fn frame_delimiter(&self) -> FrameDelimiter {
        *self.frame_delimiter.read()
    }

    fn publish_frame(&self, partial: Option<PartialReason>) -> Arc<FrameData> {
        let _serial = self.finalize.lock();
        let now = self.aggregator.now_ns();
        let frame = self.with_frame(|frame| {
            if let Some(reason) = partial {
                frame.mark_partial(reason);
            }
            frame.take(now)
        });

        // Readback may block; the frame lock is already released.
        let data = self.aggregator.finalize(frame, self.memory.snapshot());
        if let Some(trace) = &self.trace {
            if let Err(e) = trace.lock().append(&data) {
                tracing::warn!("trace write failed: {}", e);
            }
        }
        self.aggregator.publish(data)
    }
}
