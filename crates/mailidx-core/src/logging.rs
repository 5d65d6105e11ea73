//! Logging setup with mailidx segment prefixes.

/// Initialize tracing with mailidx defaults.
///
/// Sets up tracing-subscriber with:
/// - Environment filter (RUST_LOG)
/// - Compact format suitable for terminal output
///
/// Does nothing if a global subscriber is already installed.
#[cfg(not(target_arch = "wasm32"))]
pub fn init() {
    init_with_filter("info");
}

/// Initialize tracing with a custom default filter.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_with_filter(default_filter: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .try_init();
}

/// Segment prefixes for log lines.
pub mod prefix {
    /// Database lifecycle (open, upgrade, delete)
    pub const DB: &str = "⊔";
    /// Transaction settlement
    pub const TX: &str = "꩜";
}
