//! Process-wide initialization, run once at entry.

/// Environment variables forced on for every run so device errors surface at
/// the failing kernel instead of a later synchronization point.
pub const FORCED_ENV: [(&str, &str); 2] = [
    ("CUDA_LAUNCH_BLOCKING", "1"),
    ("TORCH_USE_CUDA_DSA", "1"),
];

/// Apply the forced environment. Call before any device is created.
pub fn init_environment() {
    for (key, value) in FORCED_ENV {
        std::env::set_var(key, value);
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise this crate logs at `info`, or
/// `debug` when `verbose` is set.
///
/// # Errors
///
/// Returns an error if the default directive cannot be parsed or a subscriber
/// is already installed.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("autocomplete_sft={level}")))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}

/// Index of this process among the processes launched on the local node.
///
/// Multi-process launchers export `LOCAL_RANK`; a single process is rank 0.
#[must_use]
pub fn local_process_index() -> usize {
    std::env::var("LOCAL_RANK")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}
