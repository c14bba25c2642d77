//! Logging initialization, grounded on the teacher's `tracing-subscriber`
//! setup: prefer `RUST_LOG`/`--tron` over a hardcoded level, fall back to
//! `info` otherwise.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber.
///
/// `tron` ("trace on") mirrors the daemons' `--tron` flag and `tron` config
/// option: when set, it forces `debug` level regardless of `RUST_LOG`.
pub fn init(tron: bool) {
    let filter = if tron {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
