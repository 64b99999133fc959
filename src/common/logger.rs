use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global `tracing` subscriber.
///
/// Library code only emits events; hosts (and tests) decide whether to call
/// this. `RUST_LOG` overrides the configured filter when set.
pub fn init(config: &LoggingConfig) {
    let filter_str = if config.filters.is_empty() {
        config.level.clone()
    } else {
        format!("{},{}", config.level, config.filters)
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
