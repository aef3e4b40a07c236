pub mod aggregator;
pub mod command_buffer;
pub mod config;
pub mod error;
pub mod memory;
pub mod profiler;
mod region_stack;
pub mod submission;
pub mod timestamp;
pub mod trace;

pub use aggregator::{FrameDataAggregator, InProgressFrame};
pub use command_buffer::{CommandBufferRecord, CommandBufferTracker, RecordingState};
pub use config::{FrameDelimiter, OverflowPolicy, ProfilerConfig, SamplingMode};
pub use error::ProfilerError;
pub use memory::{MemoryBindingIntervalTracker, MemoryTracker};
pub use profiler::{DeviceProfiler, SparseResource};
pub use submission::{QueueSubmissionTracker, SubmitInfo};
pub use timestamp::{AshTimestampBackend, TimestampBackend, TimestampQueryManager};
