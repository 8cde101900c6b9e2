//! Log output for the binary.

use tracing_subscriber::EnvFilter;

/// Install a formatter on stderr filtered by `RUST_LOG`, `info` when unset.
/// Stdout stays free for command output. Calling it twice is harmless.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
