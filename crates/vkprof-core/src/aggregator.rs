//! Frame finalization and the published frame ring.
//!
//! Finalization reads back timestamps, computes tick ranges and statistics
//! bottom-up, and hands out the finished frame as an immutable
//! `Arc<FrameData>`. Readers keep snapshots alive as long as they hold them;
//! the ring only drops its own reference.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use vkprof_protocol::{
    CommandBufferData, CommandStats, CpuFrameData, FrameData, FrameStatus, MemoryData,
    PartialReason, PipelineBindPoint, PipelineSummary, RegionId, RegionKind, SubmitBatchData,
    SubmitInfoData, TickRange,
};

use crate::command_buffer::CommandBufferRecord;
use crate::config::OverflowPolicy;
use crate::submission::PendingSubmitBatch;
use crate::timestamp::{ResolvedTimestamps, TimestampQueryManager};

/// The frame submissions currently attach to. Only reachable through the
/// device profiler's frame lock.
#[derive(Debug)]
pub struct InProgressFrame {
    index: u64,
    status: FrameStatus,
    submits: Vec<PendingSubmitBatch>,
    cpu_begin_ns: u64,
}

impl InProgressFrame {
    pub(crate) fn new(index: u64, cpu_begin_ns: u64) -> Self {
        Self {
            index,
            status: FrameStatus::Complete,
            submits: Vec::new(),
            cpu_begin_ns,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn submit_count(&self) -> usize {
        self.submits.len()
    }

    /// Keeps the first reason if the frame is already partial.
    pub fn mark_partial(&mut self, reason: PartialReason) {
        if self.status == FrameStatus::Complete {
            self.status = FrameStatus::Partial(reason);
        }
    }

    pub(crate) fn push(&mut self, batch: PendingSubmitBatch) {
        self.submits.push(batch);
    }

    /// Freeze this frame and open its successor in its place.
    pub(crate) fn take(&mut self, cpu_now_ns: u64) -> InProgressFrame {
        let next = InProgressFrame::new(self.index + 1, cpu_now_ns);
        std::mem::replace(self, next)
    }
}

struct FrameRing {
    frames: VecDeque<Arc<FrameData>>,
    capacity: usize,
}

impl FrameRing {
    fn push(&mut self, frame: Arc<FrameData>, policy: OverflowPolicy, max_capacity: usize) {
        while self.frames.len() >= self.capacity {
            let oldest_held = self
                .frames
                .front()
                .is_some_and(|oldest| Arc::strong_count(oldest) > 1);
            if policy == OverflowPolicy::Grow && oldest_held && self.capacity < max_capacity {
                self.capacity += 1;
                tracing::debug!("frame ring grown to {}", self.capacity);
                break;
            }
            if let Some(evicted) = self.frames.pop_front() {
                tracing::trace!("evicted frame {}", evicted.index);
            }
        }
        self.frames.push_back(frame);
    }

    fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
    }
}

pub struct FrameDataAggregator {
    timestamps: Arc<TimestampQueryManager>,
    ring: RwLock<FrameRing>,
    policy: OverflowPolicy,
    max_capacity: usize,
    epoch: Instant,
}

impl FrameDataAggregator {
    pub fn new(
        timestamps: Arc<TimestampQueryManager>,
        capacity: usize,
        policy: OverflowPolicy,
        max_capacity: usize,
        epoch: Instant,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            timestamps,
            ring: RwLock::new(FrameRing {
                frames: VecDeque::with_capacity(capacity),
                capacity,
            }),
            policy,
            max_capacity: max_capacity.max(capacity),
            epoch,
        }
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Resolve a frozen frame into its published form. Blocks on timestamp
    /// readback unless the device was lost.
    pub fn finalize(&self, frame: InProgressFrame, memory: MemoryData) -> FrameData {
        let mut status = frame.status;
        let mut readback = status != FrameStatus::Partial(PartialReason::DeviceLost);

        let mut submits = Vec::with_capacity(frame.submits.len());
        for batch in frame.submits {
            let mut infos = Vec::with_capacity(batch.submits.len());
            for info in batch.submits {
                let mut command_buffers = Vec::with_capacity(info.command_buffers.len());
                for record in info.command_buffers {
                    let mut read = false;
                    let resolved = if readback {
                        match self.timestamps.resolve(&record.blocks) {
                            Ok(resolved) => {
                                read = true;
                                resolved
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "frame {}: timestamp readback failed: {}",
                                    frame.index,
                                    e
                                );
                                readback = false;
                                if status == FrameStatus::Complete {
                                    status = FrameStatus::Partial(PartialReason::TimestampReadback);
                                }
                                ResolvedTimestamps::default()
                            }
                        }
                    } else {
                        ResolvedTimestamps::default()
                    };
                    self.timestamps.retire_submission(&record.blocks, read);
                    command_buffers.push(resolve_record(record, &resolved));
                }
                let ticks = union_ticks(command_buffers.iter().filter_map(|cb| cb.ticks()));
                infos.push(SubmitInfoData {
                    command_buffers,
                    wait_semaphores: info.wait_semaphores,
                    signal_semaphores: info.signal_semaphores,
                    ticks,
                });
            }
            submits.push(SubmitBatchData {
                queue: batch.queue,
                fence: batch.fence,
                submits: infos,
                cpu_timestamp_ns: batch.cpu_timestamp_ns,
                thread_id: batch.thread_id,
            });
        }

        let mut data = FrameData {
            index: frame.index,
            status,
            submits,
            memory,
            timestamp_period_ns: self.timestamps.timestamp_period_ns(),
            ..Default::default()
        };

        data.stats = data.command_buffers().map(|cb| *cb.stats()).sum();
        data.total_ticks = data
            .command_buffers()
            .map(|cb| cb.tree.root().duration())
            .fold(0, u64::saturating_add);
        let earliest = data
            .command_buffers()
            .filter_map(|cb| cb.ticks())
            .map(|t| t.begin)
            .min();
        data.reference_tick = if readback {
            self.timestamps.calibration_tick().or(earliest)
        } else {
            earliest
        };
        data.top_pipelines = top_pipelines(&data);

        let end_ns = self.now_ns();
        let elapsed = end_ns.saturating_sub(frame.cpu_begin_ns);
        data.cpu = CpuFrameData {
            begin_ns: frame.cpu_begin_ns,
            end_ns,
            frames_per_sec: if elapsed > 0 {
                (1e9 / elapsed as f64) as f32
            } else {
                0.0
            },
        };

        data
    }

    /// Push a finished frame into the ring.
    pub fn publish(&self, frame: FrameData) -> Arc<FrameData> {
        let frame = Arc::new(frame);
        tracing::debug!(
            "published frame {} ({} submits, {} commands, {:?})",
            frame.index,
            frame.submits.len(),
            frame.stats.command_count(),
            frame.status
        );
        self.ring
            .write()
            .push(Arc::clone(&frame), self.policy, self.max_capacity);
        frame
    }

    /// Latest published frame, or `None` before the first publication.
    pub fn latest(&self) -> Option<Arc<FrameData>> {
        self.ring.read().frames.back().cloned()
    }

    /// Every retained frame, oldest first.
    pub fn frames(&self) -> Vec<Arc<FrameData>> {
        self.ring.read().frames.iter().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.ring.read().capacity
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.ring.write().resize(capacity);
    }
}

fn union_ticks(ticks: impl Iterator<Item = TickRange>) -> Option<TickRange> {
    ticks.reduce(|a, b| a.union(&b))
}

/// Clips `ticks` into `bound`. Ranges with no overlap belong to another
/// execution of the same commands and are dropped.
fn clamp(ticks: TickRange, bound: TickRange) -> Option<TickRange> {
    if ticks.end < bound.begin || ticks.begin > bound.end {
        return None;
    }
    Some(TickRange::new(
        ticks.begin.clamp(bound.begin, bound.end),
        ticks.end.clamp(bound.begin, bound.end),
    ))
}

/// Turns a record into published data: ticks from the resolved slots,
/// descendants of execute envelopes clamped into the envelope (or cleared
/// when they fall outside it), then parents
/// widened to enclose their children and statistics summed bottom-up.
pub(crate) fn resolve_record(record: CommandBufferRecord, resolved: &ResolvedTimestamps) -> CommandBufferData {
    let CommandBufferRecord {
        handle,
        level,
        mut tree,
        slots,
        ..
    } = record;
    let len = tree.len();

    let mut ticks: Vec<Option<TickRange>> = (0..len)
        .map(|i| {
            let slots = slots.get(i)?;
            let begin = resolved.tick(slots.begin?)?;
            let end = resolved.tick(slots.end?)?;
            Some(TickRange::new(begin, end))
        })
        .collect();

    // Parents precede children, so a forward pass sees every bound first.
    let mut bounds: Vec<Option<TickRange>> = vec![None; len];
    for i in 0..len {
        if let (Some(bound), Some(t)) = (bounds[i], ticks[i]) {
            ticks[i] = clamp(t, bound);
        }
        let envelope = slots.get(i).is_some_and(|s| s.envelope);
        let inner = if envelope { ticks[i].or(bounds[i]) } else { bounds[i] };
        for child in &tree.node(RegionId(i as u32)).children {
            bounds[child.index()] = inner;
        }
    }

    let mut stats = vec![CommandStats::default(); len];
    for i in (0..len).rev() {
        let node = tree.node(RegionId(i as u32));
        let mut own = match &node.kind {
            RegionKind::Command(command) => command.stats(),
            _ => CommandStats::default(),
        };
        let mut range = ticks[i];
        for child in &node.children {
            own += stats[child.index()];
            if let Some(child_ticks) = ticks[child.index()] {
                range = Some(range.map_or(child_ticks, |r| r.union(&child_ticks)));
            }
        }
        stats[i] = own;
        ticks[i] = range;
    }

    for i in 0..len {
        let node = tree.node_mut(RegionId(i as u32));
        node.ticks = ticks[i];
        node.stats = stats[i];
    }

    CommandBufferData {
        handle,
        level,
        tree,
    }
}

fn top_pipelines(frame: &FrameData) -> Vec<PipelineSummary> {
    let mut pipelines: HashMap<(u64, PipelineBindPoint), PipelineSummary> = HashMap::new();
    for cb in frame.command_buffers() {
        for node in cb.tree.nodes() {
            if let RegionKind::Pipeline { handle, bind_point } = node.kind {
                let summary = pipelines
                    .entry((handle, bind_point))
                    .or_insert_with(|| PipelineSummary {
                        handle,
                        bind_point,
                        bind_count: 0,
                        ticks: 0,
                        stats: CommandStats::default(),
                    });
                summary.bind_count += 1;
                summary.ticks = summary.ticks.saturating_add(node.duration());
                summary.stats += node.stats;
            }
        }
    }

    let mut pipelines: Vec<PipelineSummary> = pipelines.into_values().collect();
    pipelines.sort_by(|a, b| b.ticks.cmp(&a.ticks).then(a.handle.cmp(&b.handle)));
    pipelines
}
