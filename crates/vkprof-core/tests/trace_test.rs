//! Trace file output and Chrome trace export.
//!
//! Run with: cargo test --test trace_test

use std::path::PathBuf;

use vkprof_core::trace::{chrome_trace_events, read_trace, write_chrome_trace, TraceFileWriter};
use vkprof_core::{FrameDelimiter, ProfilerConfig};
use vkprof_protocol::FrameStatus;

mod common;
use common::Harness;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vkprof-{}-{}.vkprof", name, std::process::id()))
}

fn traced_config(path: &PathBuf, compress: bool) -> ProfilerConfig {
    let mut config = ProfilerConfig::default();
    config.profiler.frame_delimiter = FrameDelimiter::Explicit;
    config.output.trace_path = Some(path.to_string_lossy().into_owned());
    config.output.compress = compress;
    config
}

#[test]
fn test_published_frames_are_appended_to_trace() {
    let path = temp_path("append");
    {
        let h = Harness::with_config(traced_config(&path, true));
        for draws in 1..=3 {
            let cb = h.record_simple(draws);
            h.submit(&[cb]);
            h.profiler.finish_frame();
        }
    }

    let frames = read_trace(&path).expect("read trace");
    assert_eq!(frames.len(), 3);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.index, i as u64);
        assert_eq!(frame.status, FrameStatus::Complete);
        assert_eq!(frame.stats.draw_count, i as u32 + 1);
    }
    std::fs::remove_file(&path).expect("cleanup");
}

#[test]
fn test_trace_round_trip_matches_published_frame() {
    let path = temp_path("roundtrip");
    let published = {
        let h = Harness::with_config(traced_config(&path, false));
        let cb = h.record_simple(4);
        h.submit(&[cb]);
        h.profiler.finish_frame()
    };

    let frames = read_trace(&path).expect("read trace");
    assert_eq!(frames, [(*published).clone()]);
    std::fs::remove_file(&path).expect("cleanup");
}

#[test]
fn test_writer_counts_frames() {
    let path = temp_path("writer");
    let h = Harness::with_config({
        let mut config = ProfilerConfig::default();
        config.profiler.frame_delimiter = FrameDelimiter::Explicit;
        config
    });
    let frame = h.profiler.finish_frame();

    let mut writer = TraceFileWriter::create(&path, true).expect("create");
    writer.append(&frame).expect("append");
    writer.append(&frame).expect("append");
    assert_eq!(writer.frames_written(), 2);
    assert_eq!(writer.path(), path.as_path());
    drop(writer);

    assert_eq!(read_trace(&path).expect("read trace").len(), 2);
    std::fs::remove_file(&path).expect("cleanup");
}

#[test]
fn test_read_missing_trace_fails() {
    assert!(read_trace(temp_path("missing-never-written")).is_err());
}

#[test]
fn test_chrome_trace_export() {
    let h = Harness::new();
    let cb = h.record_simple(2);
    h.submit(&[cb]);
    let frame = h.profiler.finish_frame();

    let events = chrome_trace_events(&[(*frame).clone()]);
    // Every timed region plus the frame itself.
    let regions = frame.command_buffers().map(|cb| cb.tree.len()).sum::<usize>();
    assert_eq!(events.len(), regions + 1);
    assert!(events.iter().all(|e| e.ph == "X" && e.dur >= 0.0));
    assert!(events.iter().any(|e| e.name == "vkCmdDraw"));
    assert!(events.iter().any(|e| e.name == "Frame 0" && e.tid == 0));

    let mut out = Vec::new();
    write_chrome_trace(&mut out, &[(*frame).clone()]).expect("export");
    let json: serde_json::Value = serde_json::from_slice(&out).expect("valid json");
    let trace_events = json["traceEvents"].as_array().expect("traceEvents");
    assert_eq!(trace_events.len(), events.len());
    assert_eq!(json["displayTimeUnit"], "ns");
}

#[test]
fn test_chrome_trace_exports_debug_label_spans() {
    let h = Harness::new();
    let cb = h.primary();
    h.begin(cb);
    h.profiler.begin_debug_label(cb, "upload", [0.0, 1.0, 0.0, 1.0]);
    h.dispatch(cb);
    h.profiler.end_debug_label(cb);
    h.end(cb);
    h.submit(&[cb]);
    let frame = h.profiler.finish_frame();

    let events = chrome_trace_events(&[(*frame).clone()]);
    let label = events
        .iter()
        .find(|e| e.cat == "debug_label")
        .expect("label event");
    assert_eq!(label.name, "upload");
    assert_eq!(label.args["color"], "#00ff00ff");
    assert!(label.dur > 0.0);
    assert!(!events.iter().any(|e| e.name.starts_with("vkCmdBeginDebugUtilsLabelEXT")));
}
