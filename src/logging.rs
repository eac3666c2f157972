//! Logging bootstrap for firmware builds that embed the runtime.
//!
//! The crate itself only emits `tracing` events; installing a subscriber is the
//! embedder's choice. This helper wires up a JSON subscriber filtered by the
//! `TALKBOX_LOG` environment variable (default `error`) for builds that want
//! one without depending on `tracing-subscriber` themselves.

/// Install the JSON subscriber. Safe to call more than once; later calls lose
/// the race and are ignored.
#[cfg(feature = "logging")]
pub fn init() {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::builder()
        .with_env_var("TALKBOX_LOG")
        .with_default_directive(LevelFilter::ERROR.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_env_filter(filter)
        .try_init();
}

/// Stub for builds without the `logging` feature, so embedders can call
/// `talkbox::logging::init()` unconditionally.
#[cfg(not(feature = "logging"))]
pub fn init() {}
