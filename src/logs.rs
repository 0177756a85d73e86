//! Logging setup for programs embedding subproc.
use tracing_subscriber::EnvFilter;

/// Builds the filter for [`init_logging`].
///
/// An explicit level wins, then `RUST_LOG`, then `info`.
pub fn log_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Installs a global `fmt` subscriber. Later calls are ignored.
pub fn init_logging(level: Option<&str>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(level))
        .try_init();
}
