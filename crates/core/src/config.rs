use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::Result;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub sandbox: SandboxConfig,
    pub telemetry: TelemetryConfig,
}

/// Which sandbox backend the facade should use.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Probe the container daemon once at startup and fall back to simulation.
    #[default]
    Auto,
    /// Always use the container daemon; fail startup if it is unreachable.
    Docker,
    /// Never touch a container daemon.
    Simulated,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: BackendKind,
    /// Container names are `{container_prefix}{workspace_id}`.
    pub container_prefix: String,
    /// Host directory holding one subdirectory per workspace.
    pub workspaces_root: String,
    /// Where the workspace directory is bind-mounted inside the container.
    pub mount_path: String,
    /// In-container root for compiled artifacts.
    pub build_root: String,
    pub default_image: String,
    /// Runtime name to image overrides.
    pub images: HashMap<String, String>,
    pub default_runtime: String,
    pub default_memory_limit: String,
    pub default_cpu_limit: String,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub stop_timeout_secs: i64,
    /// Probability in [0, 1] that an exec samples container resource usage.
    pub metrics_sample_rate: f64,
    pub simulated_chunk_size: usize,
    pub simulated_chunk_delay_ms: u64,
}

impl SandboxConfig {
    /// Image to use for a runtime, falling back to the default image.
    pub fn image_for(&self, runtime: &str) -> &str {
        self.images
            .get(runtime)
            .map(String::as_str)
            .unwrap_or(&self.default_image)
    }

    /// Deterministic container name for a workspace.
    pub fn container_name(&self, workspace_id: &str) -> String {
        format!("{}{}", self.container_prefix, workspace_id)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            container_prefix: "devbox-ws-".into(),
            workspaces_root: "/var/lib/devbox/workspaces".into(),
            mount_path: "/workspace".into(),
            build_root: "/tmp/devbox-build".into(),
            default_image: "devbox-runtime:latest".into(),
            images: HashMap::new(),
            default_runtime: "generic".into(),
            default_memory_limit: "512m".into(),
            default_cpu_limit: "1".into(),
            idle_ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            stop_timeout_secs: 5,
            metrics_sample_rate: 0.1,
            simulated_chunk_size: 16,
            simulated_chunk_delay_ms: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_filter: String,
    pub json_logs: bool,
    /// Address for the Prometheus scrape endpoint, e.g. `0.0.0.0:9090`.
    pub metrics_addr: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,devbox=debug,devbox_sandbox=debug".into(),
            json_logs: false,
            metrics_addr: None,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let env = std::env::var("DEVBOX_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map DEVBOX__SANDBOX__IDLE_TTL_SECS=600 to sandbox.idle_ttl_secs
            .add_source(Environment::with_prefix("DEVBOX").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }
}
