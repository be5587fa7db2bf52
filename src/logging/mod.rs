//! Process-wide tracing setup.

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Filter directives for backflow alone; takes precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "BACKFLOW_LOG";

/// `init_logging_with("info")`.
pub fn init_logging() {
    init_logging_with("info");
}

/// Installs the global subscriber with compact, UTC RFC 3339 stamped output.
///
/// Directives come from `BACKFLOW_LOG`, else `RUST_LOG`, else `fallback`; a
/// malformed variable falls back too. Returns `false` when a subscriber was
/// already installed, which leaves that one in place.
pub fn init_logging_with(fallback: &str) -> bool {
    let directives = pick_directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        fallback,
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("ignoring log filter {directives:?}: {err}");
        EnvFilter::new(fallback)
    });

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_target(true)
        .compact();

    Registry::default()
        .with(filter)
        .with(formatting_layer)
        .try_init()
        .is_ok()
}

fn pick_directives(own: Option<String>, rust_log: Option<String>, fallback: &str) -> String {
    [own, rust_log]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
