use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::region::PipelineBindPoint;

// ============================================================================
// Profiled commands
// ============================================================================

/// `VK_WHOLE_SIZE`: the range extends to the end of the buffer. Counted as
/// zero bytes unless the size was resolved before recording.
pub const WHOLE_SIZE: u64 = u64::MAX;

/// A single intercepted GPU command together with the parameters the
/// profiler keeps for it. Resource handles are raw Vulkan handle values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Command {
    // ── Draws ───────────────────────────────────────────────
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: u64,
        offset: u64,
        draw_count: u32,
        stride: u32,
        indexed: bool,
    },
    DrawIndirectCount {
        buffer: u64,
        offset: u64,
        count_buffer: u64,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
        indexed: bool,
    },

    // ── Compute ─────────────────────────────────────────────
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    DispatchIndirect {
        buffer: u64,
        offset: u64,
    },

    // ── Transfer ────────────────────────────────────────────
    CopyBuffer {
        src_buffer: u64,
        dst_buffer: u64,
        size: u64,
    },
    CopyBufferToImage {
        src_buffer: u64,
        dst_image: u64,
        size: u64,
    },
    CopyImage {
        src_image: u64,
        dst_image: u64,
        size: u64,
    },
    CopyImageToBuffer {
        src_image: u64,
        dst_buffer: u64,
        size: u64,
    },
    BlitImage {
        src_image: u64,
        dst_image: u64,
    },
    ResolveImage {
        src_image: u64,
        dst_image: u64,
    },
    FillBuffer {
        buffer: u64,
        offset: u64,
        size: u64,
        data: u32,
    },
    UpdateBuffer {
        buffer: u64,
        offset: u64,
        size: u64,
    },

    // ── Clears ──────────────────────────────────────────────
    ClearAttachments {
        attachment_count: u32,
    },
    ClearColorImage {
        image: u64,
    },
    ClearDepthStencilImage {
        image: u64,
    },

    // ── Synchronization ─────────────────────────────────────
    PipelineBarrier {
        memory_barrier_count: u32,
        buffer_barrier_count: u32,
        image_barrier_count: u32,
    },

    // ── Secondary execution ─────────────────────────────────
    ExecuteCommands {
        command_buffer_count: u32,
    },

    // ── Debug utils labels ──────────────────────────────────
    /// Opens a label; labels nest until the matching [`Command::EndDebugLabel`].
    BeginDebugLabel {
        name: String,
        color: LabelColor,
    },
    EndDebugLabel,
    InsertDebugLabel {
        name: String,
        color: LabelColor,
    },
}

/// Label color as 8-bit RGBA.
pub type LabelColor = [u8; 4];

/// Converts a `VkDebugUtilsLabelEXT` float color.
pub fn label_color(color: [f32; 4]) -> LabelColor {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

/// Coarse grouping of commands, used for statistics and sink selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCategory {
    Draw,
    Dispatch,
    Transfer,
    Clear,
    Barrier,
    Execute,
    DebugLabel,
}

impl Command {
    pub fn category(&self) -> CommandCategory {
        match self {
            Command::Draw { .. }
            | Command::DrawIndexed { .. }
            | Command::DrawIndirect { .. }
            | Command::DrawIndirectCount { .. } => CommandCategory::Draw,
            Command::Dispatch { .. } | Command::DispatchIndirect { .. } => CommandCategory::Dispatch,
            Command::CopyBuffer { .. }
            | Command::CopyBufferToImage { .. }
            | Command::CopyImage { .. }
            | Command::CopyImageToBuffer { .. }
            | Command::BlitImage { .. }
            | Command::ResolveImage { .. }
            | Command::FillBuffer { .. }
            | Command::UpdateBuffer { .. } => CommandCategory::Transfer,
            Command::ClearAttachments { .. }
            | Command::ClearColorImage { .. }
            | Command::ClearDepthStencilImage { .. } => CommandCategory::Clear,
            Command::PipelineBarrier { .. } => CommandCategory::Barrier,
            Command::ExecuteCommands { .. } => CommandCategory::Execute,
            Command::BeginDebugLabel { .. }
            | Command::EndDebugLabel
            | Command::InsertDebugLabel { .. } => CommandCategory::DebugLabel,
        }
    }

    /// Application label text, for label commands.
    pub fn label(&self) -> Option<&str> {
        match self {
            Command::BeginDebugLabel { name, .. } | Command::InsertDebugLabel { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }

    /// Pipeline bind point whose bound pipeline executes this command, if any.
    pub fn bind_point(&self) -> Option<PipelineBindPoint> {
        match self.category() {
            CommandCategory::Draw => Some(PipelineBindPoint::Graphics),
            CommandCategory::Dispatch => Some(PipelineBindPoint::Compute),
            _ => None,
        }
    }

    /// Statistics contributed by this command alone.
    pub fn stats(&self) -> CommandStats {
        let mut stats = CommandStats::default();
        match *self {
            Command::Draw { .. } | Command::DrawIndexed { .. } => stats.draw_count = 1,
            Command::DrawIndirect { .. } | Command::DrawIndirectCount { .. } => {
                stats.draw_indirect_count = 1
            }
            Command::Dispatch { .. } => stats.dispatch_count = 1,
            Command::DispatchIndirect { .. } => stats.dispatch_indirect_count = 1,
            Command::CopyBuffer { size, .. }
            | Command::CopyBufferToImage { size, .. }
            | Command::CopyImage { size, .. }
            | Command::CopyImageToBuffer { size, .. } => {
                stats.copy_count = 1;
                stats.bytes_transferred = size;
            }
            Command::FillBuffer { size, .. } | Command::UpdateBuffer { size, .. } => {
                stats.copy_count = 1;
                stats.bytes_transferred = if size == WHOLE_SIZE { 0 } else { size };
            }
            Command::BlitImage { .. } => stats.blit_count = 1,
            Command::ResolveImage { .. } => stats.resolve_count = 1,
            Command::ClearAttachments { .. }
            | Command::ClearColorImage { .. }
            | Command::ClearDepthStencilImage { .. } => stats.clear_count = 1,
            Command::PipelineBarrier { .. } => stats.barrier_count = 1,
            Command::ExecuteCommands { .. }
            | Command::BeginDebugLabel { .. }
            | Command::EndDebugLabel
            | Command::InsertDebugLabel { .. } => {}
        }
        stats
    }

    /// Short human-readable name, matching the Vulkan entry point.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Draw { .. } => "vkCmdDraw",
            Command::DrawIndexed { .. } => "vkCmdDrawIndexed",
            Command::DrawIndirect { indexed: false, .. } => "vkCmdDrawIndirect",
            Command::DrawIndirect { indexed: true, .. } => "vkCmdDrawIndexedIndirect",
            Command::DrawIndirectCount { indexed: false, .. } => "vkCmdDrawIndirectCount",
            Command::DrawIndirectCount { indexed: true, .. } => "vkCmdDrawIndexedIndirectCount",
            Command::Dispatch { .. } => "vkCmdDispatch",
            Command::DispatchIndirect { .. } => "vkCmdDispatchIndirect",
            Command::CopyBuffer { .. } => "vkCmdCopyBuffer",
            Command::CopyBufferToImage { .. } => "vkCmdCopyBufferToImage",
            Command::CopyImage { .. } => "vkCmdCopyImage",
            Command::CopyImageToBuffer { .. } => "vkCmdCopyImageToBuffer",
            Command::BlitImage { .. } => "vkCmdBlitImage",
            Command::ResolveImage { .. } => "vkCmdResolveImage",
            Command::FillBuffer { .. } => "vkCmdFillBuffer",
            Command::UpdateBuffer { .. } => "vkCmdUpdateBuffer",
            Command::ClearAttachments { .. } => "vkCmdClearAttachments",
            Command::ClearColorImage { .. } => "vkCmdClearColorImage",
            Command::ClearDepthStencilImage { .. } => "vkCmdClearDepthStencilImage",
            Command::PipelineBarrier { .. } => "vkCmdPipelineBarrier",
            Command::ExecuteCommands { .. } => "vkCmdExecuteCommands",
            Command::BeginDebugLabel { .. } => "vkCmdBeginDebugUtilsLabelEXT",
            Command::EndDebugLabel => "vkCmdEndDebugUtilsLabelEXT",
            Command::InsertDebugLabel { .. } => "vkCmdInsertDebugUtilsLabelEXT",
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Command counters aggregated bottom-up through the region hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CommandStats {
    pub draw_count: u32,
    pub draw_indirect_count: u32,
    pub dispatch_count: u32,
    pub dispatch_indirect_count: u32,
    pub copy_count: u32,
    pub clear_count: u32,
    pub resolve_count: u32,
    pub blit_count: u32,
    pub barrier_count: u32,
    /// Bytes written or read by transfer commands.
    pub bytes_transferred: u64,
}

impl CommandStats {
    /// Total number of counted commands.
    pub fn command_count(&self) -> u64 {
        [
            self.draw_count,
            self.draw_indirect_count,
            self.dispatch_count,
            self.dispatch_indirect_count,
            self.copy_count,
            self.clear_count,
            self.resolve_count,
            self.blit_count,
            self.barrier_count,
        ]
        .iter()
        .map(|&c| c as u64)
        .sum()
    }

    pub fn is_empty(&self) -> bool {
        *self == CommandStats::default()
    }
}

impl AddAssign for CommandStats {
    fn add_assign(&mut self, rh: Self) {
        // Totals clip at the field maximum.
        self.draw_count = self.draw_count.saturating_add(rh.draw_count);
        self.draw_indirect_count = self.draw_indirect_count.saturating_add(rh.draw_indirect_count);
        self.dispatch_count = self.dispatch_count.saturating_add(rh.dispatch_count);
        self.dispatch_indirect_count = self
            .dispatch_indirect_count
            .saturating_add(rh.dispatch_indirect_count);
        self.copy_count = self.copy_count.saturating_add(rh.copy_count);
        self.clear_count = self.clear_count.saturating_add(rh.clear_count);
        self.resolve_count = self.resolve_count.saturating_add(rh.resolve_count);
        self.blit_count = self.blit_count.saturating_add(rh.blit_count);
        self.barrier_count = self.barrier_count.saturating_add(rh.barrier_count);
        self.bytes_transferred = self.bytes_transferred.saturating_add(rh.bytes_transferred);
    }
}

impl Add for CommandStats {
    type Output = CommandStats;

    fn add(mut self, rh: Self) -> Self::Output {
        self += rh;
        self
    }
}

impl std::iter::Sum for CommandStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(CommandStats::default(), Add::add)
    }
}
