//! Queue submission tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ash::vk::{self, Handle};
use vkprof_protocol::CommandBufferLevel;

use crate::aggregator::InProgressFrame;
use crate::command_buffer::CommandBufferRecord;
use crate::error::ProfilerError;

/// One `VkSubmitInfo`, as seen by the interception layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

#[derive(Debug)]
pub(crate) struct PendingSubmitInfo {
    pub command_buffers: Vec<CommandBufferRecord>,
    pub wait_semaphores: Vec<u64>,
    pub signal_semaphores: Vec<u64>,
}

/// A submission whose timestamps have not been read back yet.
#[derive(Debug)]
pub(crate) struct PendingSubmitBatch {
    pub queue: u64,
    pub fence: Option<u64>,
    pub submits: Vec<PendingSubmitInfo>,
    pub cpu_timestamp_ns: u64,
    pub thread_id: u64,
}

/// Small process-local id of the calling thread.
pub fn current_thread_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static THREAD_ID: u64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_ID.with(|id| *id)
}

fn raw_handles<H: Handle + Copy>(handles: &[H]) -> Vec<u64> {
    handles.iter().map(|h| h.as_raw()).collect()
}

pub struct QueueSubmissionTracker {
    epoch: Instant,
}

impl QueueSubmissionTracker {
    pub fn new(epoch: Instant) -> Self {
        Self { epoch }
    }

    /// Builds the batch of one submission call, copying the record of every
    /// referenced command buffer through `snapshot`. Command buffers without a
    /// usable record are kept in place as empty placeholders.
    pub(crate) fn build_batch(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo<'_>],
        fence: vk::Fence,
        mut snapshot: impl FnMut(vk::CommandBuffer) -> Result<CommandBufferRecord, ProfilerError>,
    ) -> PendingSubmitBatch {
        let submits = submits
            .iter()
            .map(|info| PendingSubmitInfo {
                command_buffers: info
                    .command_buffers
                    .iter()
                    .map(|&command_buffer| match snapshot(command_buffer) {
                        Ok(record) => {
                            if record.level() == CommandBufferLevel::Secondary {
                                tracing::warn!(
                                    "secondary command buffer {:#x} submitted directly",
                                    record.handle()
                                );
                            }
                            record.mark_submitted();
                            record
                        }
                        Err(e) => {
                            tracing::warn!("submitting placeholder: {}", e);
                            CommandBufferRecord::placeholder(
                                command_buffer.as_raw(),
                                CommandBufferLevel::Primary,
                            )
                        }
                    })
                    .collect(),
                wait_semaphores: raw_handles(info.wait_semaphores),
                signal_semaphores: raw_handles(info.signal_semaphores),
            })
            .collect();

        PendingSubmitBatch {
            queue: queue.as_raw(),
            fence: (fence != vk::Fence::null()).then(|| fence.as_raw()),
            submits,
            cpu_timestamp_ns: self.epoch.elapsed().as_nanos() as u64,
            thread_id: current_thread_id(),
        }
    }

    /// Appends a batch to the open frame. The caller holds the frame lock.
    pub(crate) fn append(&self, frame: &mut InProgressFrame, batch: PendingSubmitBatch) {
        tracing::trace!(
            "frame {}: queue {:#x} submit with {} info(s)",
            frame.index(),
            batch.queue,
            batch.submits.len()
        );
        frame.push(batch);
    }
}
