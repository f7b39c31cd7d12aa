//! Tracing subscriber setup

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .with_context(|| format!("Invalid log filter `{}`", config.filter))?,
    };

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_target(true)
            .with_level(true)
            .compact()
            .with_env_filter(filter)
            .try_init()
    };

    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_filter() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            filter: "tradefeed=loudest".to_string(),
            json: false,
        };
        assert!(init_tracing(&config).is_err());
    }
}
