pub use tracing::{self, debug, error, info, instrument, trace, warn};
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The log target every CEX crate tags its events with
pub const LOG_TARGET: &str = "cex";

/// Installs the subscriber for the CEX crates.
///
/// `RUST_LOG` takes precedence when set; otherwise only [LOG_TARGET]
/// events are surfaced, at trace level.
pub fn setup_log() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{LOG_TARGET}=trace")));

    let _ = SubscriberBuilder::default()
        .with_target(true)
        .with_env_filter(filter)
        .finish()
        .try_init();
}
