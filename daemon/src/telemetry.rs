//! Tracing initialisation.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "beancache_daemon=debug,beancache_engine=debug";

/// Install the global tracing subscriber.
///
/// `filter` wins over `RUST_LOG`, which wins over the built-in default.
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(filter: Option<&str>) -> bool {
    let env_filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
