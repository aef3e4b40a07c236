//! Trace files: a stream of framed packets, one per published frame.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use vkprof_protocol::{wire, CommandCategory, FrameData, RegionKind, TickRange};

use crate::error::ProfilerError;

pub struct TraceFileWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    compress: bool,
    frames_written: u64,
}

impl TraceFileWriter {
    /// Create (or truncate) the trace file at `path`.
    pub fn create(path: impl AsRef<Path>, compress: bool) -> Result<Self, ProfilerError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            compress,
            frames_written: 0,
        })
    }

    /// Append one frame. The packet is flushed so a crashing host still
    /// leaves every published frame readable.
    pub fn append(&mut self, frame: &FrameData) -> Result<(), ProfilerError> {
        wire::write_frame(&mut self.writer, frame, self.compress)?;
        self.writer.flush()?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every frame of a trace file.
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<FrameData>, ProfilerError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut frames = Vec::new();
    while let Some(frame) = wire::read_frame(&mut reader)? {
        frames.push(frame);
    }
    Ok(frames)
}

/// A Chrome trace-event ("X" complete event).
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub cat: &'static str,
    pub ph: &'static str,
    /// Microseconds.
    pub ts: f64,
    pub dur: f64,
    pub pid: u64,
    pub tid: u64,
    pub args: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChromeTrace<'a> {
    trace_events: &'a [TraceEvent],
    display_time_unit: &'static str,
}

fn category(kind: &RegionKind) -> &'static str {
    match kind {
        RegionKind::CommandBuffer { .. } => "command_buffer",
        RegionKind::RenderPass { .. } => "render_pass",
        RegionKind::Subpass { .. } => "subpass",
        RegionKind::Pipeline { .. } => "pipeline",
        RegionKind::Command(_) => "command",
    }
}

/// Flatten frames into timeline events, one track per queue. Regions
/// without timestamps are left out.
pub fn chrome_trace_events(frames: &[FrameData]) -> Vec<TraceEvent> {
    let mut tracks: HashMap<u64, u64> = HashMap::new();
    let mut events = Vec::new();

    for frame in frames {
        let to_us = |tick: u64| (frame.cpu.begin_ns as f64 + frame.calibrated_ns(tick)) / 1000.0;

        let mut frame_ticks: Option<TickRange> = None;
        for batch in &frame.submits {
            let next = tracks.len() as u64 + 1;
            let tid = *tracks.entry(batch.queue).or_insert(next);
            for cb in batch.submits.iter().flat_map(|s| s.command_buffers.iter()) {
                for label in cb.tree.debug_labels() {
                    let Some(ticks) = label.ticks else { continue };
                    events.push(TraceEvent {
                        name: label.name.to_string(),
                        cat: "debug_label",
                        ph: "X",
                        ts: to_us(ticks.begin),
                        dur: frame.ticks_to_ns(ticks.duration()) / 1000.0,
                        pid: 1,
                        tid,
                        args: serde_json::json!({
                            "frame": frame.index,
                            "depth": label.depth,
                            "color": format!(
                                "#{:02x}{:02x}{:02x}{:02x}",
                                label.color[0], label.color[1], label.color[2], label.color[3]
                            ),
                        }),
                    });
                }
                for node in cb.tree.nodes() {
                    let label = matches!(
                        &node.kind,
                        RegionKind::Command(command) if command.category() == CommandCategory::DebugLabel
                    );
                    if label {
                        continue;
                    }
                    let Some(ticks) = node.ticks else { continue };
                    frame_ticks = Some(frame_ticks.map_or(ticks, |t| t.union(&ticks)));
                    events.push(TraceEvent {
                        name: node.kind.to_string(),
                        cat: category(&node.kind),
                        ph: "X",
                        ts: to_us(ticks.begin),
                        dur: frame.ticks_to_ns(ticks.duration()) / 1000.0,
                        pid: 1,
                        tid,
                        args: serde_json::json!({
                            "frame": frame.index,
                            "draws": node.stats.draw_count,
                            "dispatches": node.stats.dispatch_count,
                        }),
                    });
                }
            }
        }

        if let Some(ticks) = frame_ticks {
            events.push(TraceEvent {
                name: format!("Frame {}", frame.index),
                cat: "frame",
                ph: "X",
                ts: to_us(ticks.begin),
                dur: frame.ticks_to_ns(ticks.duration()) / 1000.0,
                pid: 1,
                tid: 0,
                args: serde_json::json!({
                    "status": format!("{:?}", frame.status),
                    "fps": frame.cpu.frames_per_sec,
                }),
            });
        }
    }
    events
}

/// Write frames in the Chrome trace-event JSON format.
pub fn write_chrome_trace<W: Write>(writer: W, frames: &[FrameData]) -> Result<(), ProfilerError> {
    let events = chrome_trace_events(frames);
    serde_json::to_writer(
        writer,
        &ChromeTrace {
            trace_events: &events,
            display_time_unit: "ns",
        },
    )?;
    Ok(())
}
