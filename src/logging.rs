use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ProxyError;

/// Installs the global subscriber from the `logging` config section.
pub fn init(config: &LoggingConfig) -> Result<(), ProxyError> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(&config.level)
        .map_err(|err| ProxyError::Config(format!("unknown log level '{}': {err}", config.level)))?;

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed(),
        LogFormat::Console => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| ProxyError::Config(format!("failed to install logger: {err}")))
}
