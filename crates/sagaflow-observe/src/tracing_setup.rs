//! Tracing subscriber initialization with structured logging.
//!
//! # Usage
//!
//! ```no_run
//! sagaflow_observe::tracing_setup::init_tracing("info").unwrap();
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global tracing subscriber.
///
/// Installs a structured `fmt` layer with target visibility and span close
/// timing. `RUST_LOG` overrides `default_filter` when set.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(default_filter: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()?;

    Ok(())
}
