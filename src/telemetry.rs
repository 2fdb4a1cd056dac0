//! Logging setup.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Install the global fmt subscriber.
///
/// `level` is the default (`info`, `debug`, ...); `RUST_LOG` overrides it.
/// Returns `false` if a subscriber was already installed, which leaves that
/// one in place.
pub fn init(level: &str) -> bool {
    let default = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();

    Registry::default()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .is_ok()
}
