use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use vkprof_core::config::default_config_path;
use vkprof_core::trace::{read_trace, write_chrome_trace};
use vkprof_core::ProfilerConfig;
use vkprof_protocol::{CommandBufferData, FrameData, FrameStatus};

#[derive(Parser)]
#[command(name = "vkprof")]
#[command(about = "vkprof - inspect and convert GPU frame captures")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the frames of a capture file
    Inspect {
        /// Capture file written by the profiler
        file: String,

        /// Print the region hierarchy of this frame
        #[arg(short, long)]
        frame: Option<u64>,

        /// Maximum region depth to print
        #[arg(short, long, default_value_t = 8)]
        depth: usize,
    },

    /// Convert a capture file to another format
    Convert {
        /// Capture file written by the profiler
        input: String,

        /// Output file
        output: String,

        #[arg(long, value_enum, default_value_t = Format::Chrome)]
        format: Format,
    },

    /// Print the effective profiler configuration
    Config {
        /// Configuration file path (defaults to the standard search order)
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    /// Chrome trace-event JSON (chrome://tracing, Perfetto)
    Chrome,
    /// Frame snapshots as JSON
    Json,
}

fn main() -> anyhow::Result<()> {
    vkprof_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { file, frame, depth } => {
            let frames = read_trace(&file).with_context(|| format!("reading {}", file))?;
            info!("{}: {} frame(s)", file, frames.len());

            match frame {
                Some(index) => {
                    let frame = frames
                        .iter()
                        .find(|f| f.index == index)
                        .with_context(|| format!("frame {} not in capture", index))?;
                    print_frame_tree(frame, depth);
                }
                None => print_summary(&frames),
            }
        }

        Commands::Convert {
            input,
            output,
            format,
        } => {
            let frames = read_trace(&input).with_context(|| format!("reading {}", input))?;
            let mut writer = BufWriter::new(
                File::create(&output).with_context(|| format!("creating {}", output))?,
            );
            match format {
                Format::Chrome => write_chrome_trace(&mut writer, &frames)?,
                Format::Json => serde_json::to_writer_pretty(&mut writer, &frames)?,
            }
            writer.flush()?;
            println!("Wrote {} frame(s) to {}", frames.len(), output);
        }

        Commands::Config { config } => {
            let path = config.unwrap_or_else(default_config_path);
            let mut config = ProfilerConfig::load_or_default(&path);
            for (key, err) in config.apply_env_overrides(|key| std::env::var(key).ok()) {
                eprintln!("ignoring {}: {}", key, err);
            }
            println!("# {}", path);
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn status_label(status: FrameStatus) -> String {
    match status {
        FrameStatus::Complete => "complete".to_string(),
        FrameStatus::Partial(reason) => format!("partial ({:?})", reason),
    }
}

fn print_summary(frames: &[FrameData]) {
    println!(
        "{:>6}  {:>8}  {:>6}  {:>7}  {:>10}  {:>8}  status",
        "frame", "submits", "cmdbuf", "draws", "gpu ms", "fps"
    );
    for frame in frames {
        println!(
            "{:>6}  {:>8}  {:>6}  {:>7}  {:>10.3}  {:>8.1}  {}",
            frame.index,
            frame.submits.len(),
            frame.command_buffers().count(),
            frame.stats.draw_count + frame.stats.draw_indirect_count,
            frame.gpu_time_ns() / 1e6,
            frame.cpu.frames_per_sec,
            status_label(frame.status)
        );
    }

    if let Some(last) = frames.last() {
        if !last.top_pipelines.is_empty() {
            println!();
            println!("Top pipelines in frame {}:", last.index);
            for pipeline in last.top_pipelines.iter().take(5) {
                println!(
                    "  {:#018x}  {:?}  {:>10.3} ms  {} bind(s)",
                    pipeline.handle,
                    pipeline.bind_point,
                    last.ticks_to_ns(pipeline.ticks) / 1e6,
                    pipeline.bind_count
                );
            }
        }
    }
}

fn print_frame_tree(frame: &FrameData, max_depth: usize) {
    println!(
        "Frame {} ({}), {} command buffer(s)",
        frame.index,
        status_label(frame.status),
        frame.command_buffers().count()
    );
    for (i, batch) in frame.submits.iter().enumerate() {
        println!("Submit {} on queue {:#x} (thread {})", i, batch.queue, batch.thread_id);
        for cb in batch.submits.iter().flat_map(|s| s.command_buffers.iter()) {
            print_command_buffer(frame, cb, max_depth);
        }
    }

    let memory = &frame.memory;
    println!(
        "Memory: {} allocation(s), {} bytes, {} tracked resource(s)",
        memory.total_allocation_count,
        memory.total_allocation_size,
        memory.resources.len()
    );
}

fn print_command_buffer(frame: &FrameData, cb: &CommandBufferData, max_depth: usize) {
    for (depth, _, node) in cb.tree.walk() {
        if depth > max_depth {
            continue;
        }
        let timing = match node.ticks {
            Some(ticks) => format!(
                "{:>10.3} us @ {:.3} us",
                frame.ticks_to_ns(ticks.duration()) / 1e3,
                frame.calibrated_ns(ticks.begin) / 1e3
            ),
            None => "         -".to_string(),
        };
        println!(
            "  {:indent$}{}  {}  ({} cmds)",
            "",
            node.kind,
            timing,
            node.stats.command_count(),
            indent = depth * 2
        );
    }
}
