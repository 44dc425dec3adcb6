//! Logging and metrics setup.

use crate::config::TelemetryConfig;
use crate::{Error, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Configure the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter. With `json_logs` set, events are
/// emitted as one JSON object per line.
pub fn configure_tracing(config: &TelemetryConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter.clone()),
    );

    let json_layer = config
        .json_logs
        .then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!config.json_logs).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))?;

    Ok(())
}

/// Install the Prometheus recorder with an HTTP scrape listener.
///
/// Returns `false` when no `metrics_addr` is configured; metrics macros are
/// then no-ops. Must be called from within a tokio runtime.
pub fn install_metrics_exporter(config: &TelemetryConfig) -> Result<bool> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        return Ok(false);
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::invalid_request(format!("Invalid metrics address '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus exporter: {}", e)))?;

    tracing::info!(addr = %addr, "Prometheus metrics exporter listening");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exporter_disabled_without_address() {
        let config = TelemetryConfig::default();
        assert!(!install_metrics_exporter(&config).unwrap());
    }

    #[test]
    fn test_metrics_exporter_rejects_bad_address() {
        let config = TelemetryConfig {
            metrics_addr: Some("not-an-address".into()),
            ..Default::default()
        };
        assert!(install_metrics_exporter(&config).is_err());
    }
}
