/// Tracing setup for the crawler.
///
/// Diagnostics go to stderr through `tracing`; the per-link status stream the
/// user watches is written to stdout by the spider's console events and is not
/// routed through here.
///
/// `RUST_LOG` controls filtering (default: "info"), e.g.
/// `RUST_LOG=trawl=debug,reqwest=warn`.
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    // Ignore the error if a subscriber is already set (tests init repeatedly).
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}
