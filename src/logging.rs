//! Logging initialization for binaries and tests.
//!
//! The library itself only uses the `log` macros; whoever embeds the
//! orchestrator decides how records are rendered.

/// Initialize env_logger, reading `RUST_LOG` and defaulting to `info`.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
