//! Per-command-buffer recording state machine.

use std::sync::Arc;

use ash::vk::{self, Handle};
use vkprof_protocol::{
    Command, CommandBufferLevel, PipelineBindPoint, RegionKind, RegionNode, RegionTree,
    SubpassContents,
};

use crate::config::SamplingMode;
use crate::error::ProfilerError;
use crate::region_stack::{RegionSlots, RegionStack};
use crate::timestamp::{BlockUse, TimestampQueryManager, TimestampWriter};

/// Mirrors the Vulkan command buffer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
}

/// Finished region tree of a command buffer, with the timestamp slots that
/// still have to be read back. Cloning it shares the query blocks.
#[derive(Debug, Clone)]
pub struct CommandBufferRecord {
    pub(crate) handle: u64,
    pub(crate) level: CommandBufferLevel,
    pub(crate) tree: RegionTree,
    pub(crate) slots: Vec<RegionSlots>,
    pub(crate) blocks: Vec<BlockUse>,
}

impl CommandBufferRecord {
    /// Stand-in for a submitted command buffer that has no usable record.
    pub fn placeholder(handle: u64, level: CommandBufferLevel) -> Self {
        Self {
            handle,
            level,
            tree: RegionTree::new(RegionNode::new(RegionKind::CommandBuffer { handle, level })),
            slots: vec![RegionSlots::default()],
            blocks: Vec::new(),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn tree(&self) -> &RegionTree {
        &self.tree
    }

    /// Number of timestamp queries the record reads back.
    pub fn timestamp_count(&self) -> usize {
        self.blocks.iter().map(|b| b.used as usize).sum()
    }

    /// Marks the blocks as held by one more submission.
    pub(crate) fn mark_submitted(&self) {
        for use_ in &self.blocks {
            use_.block.submit();
        }
    }
}

#[derive(Debug)]
enum Body {
    Initial,
    Recording(RegionStack),
    Executable(CommandBufferRecord),
}

pub struct CommandBufferTracker {
    handle: vk::CommandBuffer,
    level: CommandBufferLevel,
    timestamps: TimestampWriter,
    body: Body,
    /// The last pre-command hook skipped instrumentation.
    skipped_command: bool,
}

impl CommandBufferTracker {
    pub fn new(
        handle: vk::CommandBuffer,
        level: CommandBufferLevel,
        timestamps: Option<Arc<TimestampQueryManager>>,
        sampling: SamplingMode,
    ) -> Self {
        Self {
            handle,
            level,
            timestamps: TimestampWriter::new(timestamps, sampling, handle),
            body: Body::Initial,
            skipped_command: false,
        }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn state(&self) -> RecordingState {
        match self.body {
            Body::Initial => RecordingState::Initial,
            Body::Recording(_) => RecordingState::Recording,
            Body::Executable(_) => RecordingState::Executable,
        }
    }

    fn invalid_state(&self, expected: RecordingState) -> ProfilerError {
        ProfilerError::InvalidState {
            handle: self.handle.as_raw(),
            state: self.state(),
            expected,
        }
    }

    /// Run `op` against the open region stack.
    fn with_stack<R>(
        &mut self,
        op: impl FnOnce(&mut RegionStack, &mut TimestampWriter) -> Result<R, ProfilerError>,
    ) -> Result<R, ProfilerError> {
        if self.state() != RecordingState::Recording {
            return Err(self.invalid_state(RecordingState::Recording));
        }
        match &mut self.body {
            Body::Recording(stack) => op(stack, &mut self.timestamps),
            _ => Err(ProfilerError::UnknownCommandBuffer(self.handle.as_raw())),
        }
    }

    /// Start recording. `render_pass_continue` synthesizes the inherited
    /// render pass of a secondary command buffer. Beginning an executable
    /// command buffer implicitly resets it.
    pub fn begin(&mut self, render_pass_continue: bool) -> Result<(), ProfilerError> {
        if self.state() == RecordingState::Recording {
            return Err(self.invalid_state(RecordingState::Initial));
        }
        self.reset();

        let raw = self.handle.as_raw();
        let continues = render_pass_continue && self.level == CommandBufferLevel::Secondary;
        self.timestamps.set_in_render_pass(continues);
        let root = RegionKind::CommandBuffer {
            handle: raw,
            level: self.level,
        };
        let mut stack = RegionStack::new(raw, root, &mut self.timestamps);
        let inherited = if continues {
            stack.begin_inherited_render_pass(&mut self.timestamps)
        } else {
            Ok(())
        };
        self.body = Body::Recording(stack);
        tracing::trace!("command buffer {:#x} recording", raw);
        inherited
    }

    /// Finish recording. Ending with an open render pass is reported, but the
    /// open regions are closed and the buffer still becomes executable.
    pub fn end(&mut self) -> Result<(), ProfilerError> {
        let body = std::mem::replace(&mut self.body, Body::Initial);
        let stack = match body {
            Body::Recording(stack) => stack,
            other => {
                self.body = other;
                return Err(self.invalid_state(RecordingState::Recording));
            }
        };

        let finished = stack.finish(&mut self.timestamps);
        self.skipped_command = false;
        self.body = Body::Executable(CommandBufferRecord {
            handle: self.handle.as_raw(),
            level: self.level,
            tree: finished.tree,
            slots: finished.slots,
            blocks: self.timestamps.blocks().to_vec(),
        });

        if finished.render_pass_open {
            return Err(ProfilerError::RenderPassOpen(self.handle.as_raw()));
        }
        Ok(())
    }

    /// Discard the in-progress or finished tree. Submitted copies are not
    /// affected.
    pub fn reset(&mut self) {
        self.body = Body::Initial;
        self.timestamps.reset();
        self.skipped_command = false;
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        contents: SubpassContents,
    ) -> Result<(), ProfilerError> {
        let handle = render_pass.as_raw();
        self.with_stack(|stack, ts| stack.begin_render_pass(ts, handle, contents, false))
    }

    pub fn next_subpass(&mut self, contents: SubpassContents) -> Result<(), ProfilerError> {
        self.with_stack(|stack, ts| stack.next_subpass(ts, contents))
    }

    pub fn end_render_pass(&mut self) -> Result<(), ProfilerError> {
        self.with_stack(|stack, ts| stack.end_render_pass(ts, false))
    }

    /// Dynamic rendering: a render pass without a handle and a single subpass.
    pub fn begin_rendering(&mut self, contents: SubpassContents) -> Result<(), ProfilerError> {
        self.with_stack(|stack, ts| stack.begin_render_pass(ts, 0, contents, true))
    }

    pub fn end_rendering(&mut self) -> Result<(), ProfilerError> {
        self.with_stack(|stack, ts| stack.end_render_pass(ts, true))
    }

    pub fn bind_pipeline(
        &mut self,
        bind_point: PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) -> Result<(), ProfilerError> {
        let handle = pipeline.as_raw();
        self.with_stack(|stack, ts| stack.bind_pipeline(ts, bind_point, handle))
    }

    /// Pre-command hook: opens the command's region and writes its begin
    /// timestamp. On host allocation failure the command is left out.
    pub fn pre_command(&mut self, command: Command) -> Result<(), ProfilerError> {
        let result = self.with_stack(|stack, ts| stack.begin_command(ts, command));
        self.skipped_command = matches!(result, Err(ProfilerError::OutOfHostMemory(_)));
        result
    }

    /// Post-command hook: writes the end timestamp of the open command, or
    /// closes the envelope of an execute call.
    pub fn post_command(&mut self) -> Result<(), ProfilerError> {
        if std::mem::take(&mut self.skipped_command) {
            return Ok(());
        }
        let handle = self.handle.as_raw();
        let closed = self.with_stack(|stack, ts| Ok(stack.close_open_command(ts)))?;
        if !closed {
            return Err(ProfilerError::NoOpenCommand(handle));
        }
        Ok(())
    }

    /// Pre-command hook of an execute call. `secondaries` are the finished
    /// records of the executed command buffers, in execution order; the call
    /// is closed by [`post_command`](Self::post_command).
    pub fn execute_commands(&mut self, secondaries: &[CommandBufferRecord]) -> Result<(), ProfilerError> {
        let result = self.with_stack(|stack, ts| stack.execute(ts, secondaries));
        self.skipped_command = matches!(result, Err(ProfilerError::OutOfHostMemory(_)));
        result
    }

    /// Begin, end or insert a debug utils label.
    pub fn debug_label(&mut self, command: Command) -> Result<(), ProfilerError> {
        self.with_stack(|stack, ts| stack.debug_label(ts, command))
    }

    pub fn record(&self) -> Result<&CommandBufferRecord, ProfilerError> {
        match &self.body {
            Body::Executable(record) => Ok(record),
            _ => Err(self.invalid_state(RecordingState::Executable)),
        }
    }

    /// Deep copy of the finished record, for submission or execution from
    /// another command buffer.
    pub fn snapshot(&self) -> Result<CommandBufferRecord, ProfilerError> {
        self.record().cloned()
    }

    pub fn in_render_pass(&self) -> bool {
        matches!(&self.body, Body::Recording(stack) if stack.in_render_pass())
    }
}
