use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable controlling log verbosity.
pub const LOG_ENV: &str = "VKPROF_LOG";

/// Initialize structured logging with environment filter.
/// Set VKPROF_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but tolerates an already-installed subscriber.
///
/// The profiler is loaded into foreign processes that may have set up their
/// own `tracing` subscriber; in that case ours is silently skipped.
pub fn try_init_logging() -> bool {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}
