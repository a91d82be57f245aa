//! Logging initialization.

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::settings::LoggingConfig;

/// Initialize logging from configuration. `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let fmt_layer = match config.format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.enable_target)
            .boxed(),
        "text" => tracing_subscriber::fmt::layer()
            .with_target(config.enable_target)
            .boxed(),
        other => return Err(anyhow!("Unknown log format '{}'", other)),
    };

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("Logging initialized ({} format)", config.format);
    Ok(())
}
