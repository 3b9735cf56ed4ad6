use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect. The filter can be overridden with
/// `TETHER_LOG_FILTER` (standard EnvFilter syntax).
pub fn init() {
    INIT.get_or_init(|| {
        let filter = std::env::var("TETHER_LOG_FILTER")
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_level(true)
            .with_target(true)
            .try_init();
    });
}
