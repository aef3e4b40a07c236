pub mod command;
pub mod error;
pub mod frame;
pub mod memory;
pub mod region;
pub mod wire;

pub use command::{label_color, Command, CommandCategory, CommandStats, LabelColor, WHOLE_SIZE};
pub use error::ProtocolError;
pub use frame::{
    CommandBufferData, CpuFrameData, FrameData, FrameStatus, PartialReason, PipelineSummary,
    SubmitBatchData, SubmitInfoData,
};
pub use memory::{
    HeapMemoryData, MemoryBindingInterval, MemoryData, MemoryTypeData, ResourceKind,
    ResourceMemoryData,
};
pub use region::{
    CommandBufferLevel, DebugLabel, PipelineBindPoint, RegionId, RegionKind, RegionNode, RegionTree,
    SubpassContents, TickRange,
};
