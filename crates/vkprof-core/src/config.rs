use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "VKPROF_CONFIG";
pub const FRAME_DELIMITER_ENV: &str = "VKPROF_FRAME_DELIMITER";
pub const SAMPLING_MODE_ENV: &str = "VKPROF_SAMPLING_MODE";
pub const FRAME_COUNT_ENV: &str = "VKPROF_FRAME_COUNT";

/// Top-level profiler configuration, loaded from vkprof.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilerConfig {
    #[serde(default)]
    pub profiler: CaptureConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// When a frame ends: at present, or only on explicit `finish_frame`
    #[serde(default)]
    pub frame_delimiter: FrameDelimiter,
    /// Finest region granularity that receives GPU timestamps
    #[serde(default)]
    pub sampling_mode: SamplingMode,
    /// Number of published frames the ring retains
    #[serde(default = "default_frame_count")]
    pub frame_count: u32,
    /// What to do when the ring is full
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Upper bound for the ring under the `grow` policy
    #[serde(default = "default_max_frame_count")]
    pub max_frame_count: u32,
    /// Timestamp queries per query pool
    #[serde(default = "default_query_block_size")]
    pub query_block_size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Merge adjacent sparse bindings that map contiguous memory
    #[serde(default)]
    pub coalesce_sparse_bindings: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Append every published frame to this trace file
    pub trace_path: Option<String>,
    /// LZ4-compress trace packets
    #[serde(default = "default_true")]
    pub compress: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDelimiter {
    /// Finish the frame on every successful present
    #[default]
    Present,
    /// Frames end only on `finish_frame`
    Explicit,
}

/// Timestamp granularity. Regions finer than the mode are still recorded
/// structurally but carry no ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    Frame,
    RenderPass,
    Pipeline,
    #[default]
    Drawcall,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest snapshot; readers holding it keep it alive
    #[default]
    DropOldest,
    /// Grow the ring instead of evicting a snapshot a reader still holds
    Grow,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_delimiter: FrameDelimiter::default(),
            sampling_mode: SamplingMode::default(),
            frame_count: default_frame_count(),
            overflow_policy: OverflowPolicy::default(),
            max_frame_count: default_max_frame_count(),
            query_block_size: default_query_block_size(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            trace_path: None,
            compress: true,
        }
    }
}

impl ProfilerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ProfilerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring config file {}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Config from the default location with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::load_or_default(&default_config_path());
        for (key, err) in config.apply_env_overrides(|key| std::env::var(key).ok()) {
            tracing::warn!("ignoring {}: {}", key, err);
        }
        config
    }

    /// Apply `VKPROF_*` overrides read through `lookup`. Invalid values are
    /// skipped and returned.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<(&'static str, ConfigError)> {
        let mut rejected = Vec::new();

        if let Some(value) = lookup(FRAME_DELIMITER_ENV) {
            match value.parse() {
                Ok(delimiter) => self.profiler.frame_delimiter = delimiter,
                Err(e) => rejected.push((FRAME_DELIMITER_ENV, e)),
            }
        }
        if let Some(value) = lookup(SAMPLING_MODE_ENV) {
            match value.parse() {
                Ok(mode) => self.profiler.sampling_mode = mode,
                Err(e) => rejected.push((SAMPLING_MODE_ENV, e)),
            }
        }
        if let Some(value) = lookup(FRAME_COUNT_ENV) {
            match value.trim().parse::<u32>() {
                Ok(count) if count > 0 => self.profiler.frame_count = count,
                _ => rejected.push((
                    FRAME_COUNT_ENV,
                    ConfigError::InvalidValue {
                        key: "frame_count",
                        value,
                    },
                )),
            }
        }

        rejected
    }
}

impl FromStr for FrameDelimiter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(FrameDelimiter::Present),
            "explicit" | "manual" => Ok(FrameDelimiter::Explicit),
            _ => Err(ConfigError::InvalidValue {
                key: "frame_delimiter",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for SamplingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frame" => Ok(SamplingMode::Frame),
            "render_pass" | "renderpass" => Ok(SamplingMode::RenderPass),
            "pipeline" => Ok(SamplingMode::Pipeline),
            "drawcall" | "draw_call" => Ok(SamplingMode::Drawcall),
            _ => Err(ConfigError::InvalidValue {
                key: "sampling_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Returns the config file path.
/// Search order:
/// 1. `VKPROF_CONFIG`
/// 2. System-wide config: `%PROGRAMDATA%\vkprof\vkprof.toml` (Windows) or `/etc/vkprof/vkprof.toml`
/// 3. Local fallback: `./vkprof.toml`
pub fn default_config_path() -> String {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return path;
        }
    }
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\vkprof\vkprof.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/vkprof/vkprof.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "vkprof.toml".to_string()
}

fn default_frame_count() -> u32 {
    3
}

fn default_max_frame_count() -> u32 {
    16
}

fn default_query_block_size() -> u32 {
    256
}

fn default_true() -> bool {
    true
}
