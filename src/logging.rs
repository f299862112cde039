/// Logging setup
///
/// Installs a `tracing` subscriber writing to stderr. The filter comes from
/// `RUST_LOG` and defaults to `info`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// Returns `false` if a subscriber was already installed (tests, embedding
/// applications), in which case the existing one stays in place.
pub fn init_logging() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
