use serde::{Deserialize, Serialize};

use crate::command::CommandStats;
use crate::error::ProtocolError;
use crate::memory::MemoryData;
use crate::region::{CommandBufferLevel, PipelineBindPoint, RegionId, RegionNode, RegionTree, TickRange};

/// Profiling data of one command buffer, as submitted.
///
/// The root node of `tree` is the command buffer itself and carries the
/// buffer-wide statistics and tick range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CommandBufferData {
    pub handle: u64,
    pub level: CommandBufferLevel,
    pub tree: RegionTree,
}

impl CommandBufferData {
    pub fn stats(&self) -> &CommandStats {
        &self.tree.root().stats
    }

    pub fn ticks(&self) -> Option<TickRange> {
        self.tree.root().ticks
    }

    /// Top-level regions of the command buffer.
    pub fn regions(&self) -> impl Iterator<Item = (RegionId, &RegionNode)> + '_ {
        self.tree.children(RegionId::ROOT)
    }
}

/// One `VkSubmitInfo` worth of command buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SubmitInfoData {
    pub command_buffers: Vec<CommandBufferData>,
    pub wait_semaphores: Vec<u64>,
    pub signal_semaphores: Vec<u64>,
    pub ticks: Option<TickRange>,
}

/// One `vkQueueSubmit` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SubmitBatchData {
    pub queue: u64,
    pub fence: Option<u64>,
    pub submits: Vec<SubmitInfoData>,
    /// Host time of the submission, nanoseconds since profiler creation.
    pub cpu_timestamp_ns: u64,
    pub thread_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum PartialReason {
    DeviceLost,
    SubmissionFailed,
    TimestampReadback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum FrameStatus {
    #[default]
    Complete,
    Partial(PartialReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CpuFrameData {
    pub begin_ns: u64,
    pub end_ns: u64,
    pub frames_per_sec: f32,
}

/// A pipeline aggregated over every bind in the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct PipelineSummary {
    pub handle: u64,
    pub bind_point: PipelineBindPoint,
    pub bind_count: u32,
    pub ticks: u64,
    pub stats: CommandStats,
}

/// One published, immutable frame snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct FrameData {
    pub index: u64,
    pub status: FrameStatus,
    pub submits: Vec<SubmitBatchData>,
    pub memory: MemoryData,
    pub stats: CommandStats,
    /// Sum of command buffer durations, in ticks.
    pub total_ticks: u64,
    /// Length of one device tick in nanoseconds.
    pub timestamp_period_ns: f64,
    /// Tick every region of the frame is calibrated against.
    pub reference_tick: Option<u64>,
    pub cpu: CpuFrameData,
    /// Sorted by GPU time, longest first.
    pub top_pipelines: Vec<PipelineSummary>,
}

impl FrameData {
    pub fn empty(index: u64) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.status, FrameStatus::Partial(_))
    }

    /// Every submitted command buffer in submission order.
    pub fn command_buffers(&self) -> impl Iterator<Item = &CommandBufferData> + '_ {
        self.submits
            .iter()
            .flat_map(|batch| batch.submits.iter())
            .flat_map(|submit| submit.command_buffers.iter())
    }

    /// Checks the region arena of every command buffer.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.command_buffers().try_for_each(|cb| cb.tree.validate())
    }

    pub fn ticks_to_ns(&self, ticks: u64) -> f64 {
        ticks as f64 * self.timestamp_period_ns
    }

    /// Offset of `tick` from the frame reference point, in nanoseconds.
    pub fn calibrated_ns(&self, tick: u64) -> f64 {
        let reference = self.reference_tick.unwrap_or(0);
        self.ticks_to_ns(tick.saturating_sub(reference))
    }

    pub fn gpu_time_ns(&self) -> f64 {
        self.ticks_to_ns(self.total_ticks)
    }
}
