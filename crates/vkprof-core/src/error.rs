use ash::vk;

use crate::command_buffer::RecordingState;

/// Profiler-internal failures. None of these are ever returned to the
/// intercepted API call; the device profiler logs them and carries on.
#[derive(Debug, thiserror::Error)]
pub enum ProfilerError {
    #[error("unknown command buffer {0:#x}")]
    UnknownCommandBuffer(u64),

    #[error("command buffer {handle:#x} is {state:?}, expected {expected:?}")]
    InvalidState {
        handle: u64,
        state: RecordingState,
        expected: RecordingState,
    },

    #[error("command buffer {0:#x} ended with an open render pass")]
    RenderPassOpen(u64),

    #[error("command buffer {0:#x} has no open render pass")]
    NoRenderPass(u64),

    #[error("command buffer {0:#x} cannot leave an inherited render pass")]
    InheritedRenderPass(u64),

    #[error("command buffer {0:#x} has no open command")]
    NoOpenCommand(u64),

    #[error("command buffer {0:#x} already has an open command")]
    CommandAlreadyOpen(u64),

    #[error("unknown memory allocation {0:#x}")]
    UnknownAllocation(u64),

    #[error("unknown resource {0:#x}")]
    UnknownResource(u64),

    #[error("memory type {0} out of range")]
    InvalidMemoryType(u32),

    #[error("host allocation failed: {0}")]
    OutOfHostMemory(#[from] std::collections::TryReserveError),

    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("wire error: {0}")]
    Wire(#[from] vkprof_protocol::wire::WireError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
