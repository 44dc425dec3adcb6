//! Container lifecycle management.
//!
//! The [`LifecycleManager`] owns one container per workspace. It creates
//! containers on demand, coalesces concurrent creation requests for the same
//! workspace onto a single in-flight operation, reclaims idle containers in
//! the background, and rebuilds its bookkeeping from the daemon after a
//! process restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use devbox_core::{Error, Result, SandboxConfig};

use crate::engine::{ContainerEngine, ContainerInfo, ContainerSpec, ContainerStatus, ExecOutput};
use crate::limits::{parse_cpu_limit, parse_memory_limit};

/// Label marking containers this system owns.
pub const MANAGED_BY_LABEL: &str = "devbox.managed-by";
pub const WORKSPACE_LABEL: &str = "devbox.workspace";
pub const RUNTIME_LABEL: &str = "devbox.runtime";

// =============================================================================
// Lifecycle Types
// =============================================================================

/// Input to container creation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequest {
    pub workspace_id: String,
    pub runtime: String,
    /// `<integer>[b|k|m|g]`; unset or malformed means 512MB.
    pub memory_limit: Option<String>,
    /// CPU count; unset or malformed means 1.
    pub cpu_limit: Option<String>,
}

impl SandboxRequest {
    pub fn new(workspace_id: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            runtime: runtime.into(),
            memory_limit: None,
            cpu_limit: None,
        }
    }

    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    pub fn with_cpu_limit(mut self, limit: impl Into<String>) -> Self {
        self.cpu_limit = Some(limit.into());
        self
    }
}

/// The manager's bookkeeping for one workspace container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: String,
    pub workspace_id: String,
    pub runtime: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// A running container a caller may execute commands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
}

/// Basic command result shape shared by every execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `None` when the command never produced an exit status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

impl CommandResult {
    pub fn from_exec(exec: ExecOutput) -> Self {
        let success = exec.exit_code == Some(0);
        let error = match exec.exit_code {
            Some(0) => None,
            Some(code) => Some(format!("Command exited with code {}", code)),
            None => Some("Command finished without an exit code".to_string()),
        };
        Self {
            success,
            output: exec.output,
            error,
            exit_code: exec.exit_code,
        }
    }

    /// A daemon-, image- or container-level failure; no command ran to completion.
    pub fn infrastructure_failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(message.into()),
            exit_code: None,
        }
    }

    pub fn is_infrastructure_failure(&self) -> bool {
        !self.success && self.exit_code.is_none()
    }
}

/// Operation slot shared by every caller waiting on the same workspace.
type InFlight = Shared<BoxFuture<'static, std::result::Result<ContainerHandle, String>>>;

/// Counts a running exec against its workspace until dropped.
struct ActiveExec {
    active: Arc<DashMap<String, usize>>,
    workspace_id: String,
}

impl ActiveExec {
    fn begin(active: &Arc<DashMap<String, usize>>, workspace_id: &str) -> Self {
        *active.entry(workspace_id.to_string()).or_insert(0) += 1;
        Self {
            active: active.clone(),
            workspace_id: workspace_id.to_string(),
        }
    }
}

impl Drop for ActiveExec {
    fn drop(&mut self) {
        if let Some(mut count) = self.active.get_mut(&self.workspace_id) {
            *count = count.saturating_sub(1);
        }
        self.active.remove_if(&self.workspace_id, |_, count| *count == 0);
    }
}

// =============================================================================
// Lifecycle Manager
// =============================================================================

/// Owns the workspace containers of this process.
///
/// Construct one per process and share it by cloning; clones share all state.
/// Two managers pointed at the same daemon would each believe they own the
/// same containers.
#[derive(Clone)]
pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    config: Arc<SandboxConfig>,
    records: Arc<DashMap<String, ContainerRecord>>,
    in_flight: Arc<tokio::sync::Mutex<HashMap<String, InFlight>>>,
    active_execs: Arc<DashMap<String, usize>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LifecycleManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SandboxConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            records: Arc::new(DashMap::new()),
            in_flight: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            active_execs: Arc::new(DashMap::new()),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Creation request for a workspace using the configured default limits.
    pub fn request_for(&self, workspace_id: &str, runtime: &str) -> SandboxRequest {
        SandboxRequest::new(workspace_id, runtime)
            .with_memory_limit(self.config.default_memory_limit.clone())
            .with_cpu_limit(self.config.default_cpu_limit.clone())
    }

    /// Pull the image if needed, then create and start the workspace container.
    pub async fn create(&self, request: &SandboxRequest) -> Result<String> {
        let workspace_id = &request.workspace_id;
        let name = self.config.container_name(workspace_id);
        let image = self.config.image_for(&request.runtime).to_string();

        if !self.engine.image_exists(&image).await.map_err(infrastructure)? {
            tracing::info!(image = %image, workspace_id = %workspace_id, "Pulling runtime image");
            self.engine.pull_image(&image).await.map_err(infrastructure)?;
        }

        let memory_bytes = parse_memory_limit(
            request
                .memory_limit
                .as_deref()
                .unwrap_or(&self.config.default_memory_limit),
        );
        let nano_cpus = parse_cpu_limit(
            request
                .cpu_limit
                .as_deref()
                .unwrap_or(&self.config.default_cpu_limit),
        );

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.clone(),
            labels: HashMap::from([
                (MANAGED_BY_LABEL.to_string(), "devbox".to_string()),
                (WORKSPACE_LABEL.to_string(), workspace_id.clone()),
                (RUNTIME_LABEL.to_string(), request.runtime.clone()),
            ]),
            binds: vec![format!(
                "{}/{}:{}",
                self.config.workspaces_root.trim_end_matches('/'),
                workspace_id,
                self.config.mount_path
            )],
            memory_bytes,
            nano_cpus,
            working_dir: self.config.mount_path.clone(),
        };

        let id = self.engine.create_container(&spec).await.map_err(infrastructure)?;
        self.engine.start_container(&name).await.map_err(infrastructure)?;

        let now = Utc::now();
        self.records.insert(
            workspace_id.clone(),
            ContainerRecord {
                id: id.clone(),
                workspace_id: workspace_id.clone(),
                runtime: request.runtime.clone(),
                status: ContainerStatus::Running,
                created_at: now,
                last_activity_at: now,
            },
        );

        metrics::counter!("sandbox_containers_created_total", "runtime" => request.runtime.clone())
            .increment(1);
        tracing::info!(
            container = %name,
            workspace_id = %workspace_id,
            image = %image,
            memory_bytes,
            nano_cpus,
            "Workspace container created and started"
        );

        Ok(id)
    }

    /// Return a running container for the workspace, creating or starting one
    /// as needed.
    ///
    /// At most one create-or-start runs per workspace; concurrent callers wait
    /// on it. If it fails, the caller that started it gets
    /// `Error::Infrastructure` and every waiter gets `Error::LockRejection`.
    pub async fn get_or_create(&self, request: &SandboxRequest) -> Result<ContainerHandle> {
        let workspace_id = request.workspace_id.clone();

        let (operation, leader) = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&workspace_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let manager = self.clone();
                    let request = request.clone();
                    // Runs to completion even if every caller stops waiting.
                    let task = tokio::spawn(async move {
                        let result = manager
                            .ensure_running(&request)
                            .await
                            .map_err(|e| e.to_string());
                        manager.in_flight.lock().await.remove(&request.workspace_id);
                        result
                    });
                    let operation = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(format!("Container creation task failed: {}", e))
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(workspace_id.clone(), operation.clone());
                    (operation, true)
                }
            }
        };

        match operation.await {
            Ok(handle) => Ok(handle),
            Err(reason) if leader => Err(Error::infrastructure(reason)),
            Err(reason) => Err(Error::lock_rejection(workspace_id, reason)),
        }
    }

    async fn ensure_running(&self, request: &SandboxRequest) -> Result<ContainerHandle> {
        let workspace_id = &request.workspace_id;
        let name = self.config.container_name(workspace_id);

        let id = match self.engine.inspect_container(&name).await? {
            Some(info) if info.status == ContainerStatus::Running => {
                self.track(workspace_id, &info, &request.runtime);
                info.id
            }
            Some(info) => {
                tracing::info!(container = %name, status = %info.status, "Starting existing workspace container");
                self.engine.start_container(&name).await?;
                self.track(workspace_id, &info, &request.runtime);
                info.id
            }
            None => self.create(request).await?,
        };

        Ok(ContainerHandle {
            id,
            name,
            workspace_id: workspace_id.clone(),
        })
    }

    /// Record a container found on the daemon as running.
    fn track(&self, workspace_id: &str, info: &ContainerInfo, runtime: &str) {
        let now = Utc::now();
        self.records
            .entry(workspace_id.to_string())
            .and_modify(|record| {
                record.id = info.id.clone();
                record.status = ContainerStatus::Running;
                record.last_activity_at = now;
            })
            .or_insert_with(|| ContainerRecord {
                id: info.id.clone(),
                workspace_id: workspace_id.to_string(),
                runtime: info
                    .labels
                    .get(RUNTIME_LABEL)
                    .cloned()
                    .unwrap_or_else(|| runtime.to_string()),
                status: ContainerStatus::Running,
                created_at: info.created_at.unwrap_or(now),
                last_activity_at: now,
            });
    }

    /// Run `argv` in the workspace container without any shell interpretation.
    pub async fn exec_in(&self, workspace_id: &str, argv: &[String], runtime: &str) -> CommandResult {
        self.exec_in_with_env(workspace_id, argv, runtime, &HashMap::new())
            .await
    }

    /// [`exec_in`](Self::exec_in) with extra environment variables.
    ///
    /// The result is only returned once the output stream has ended.
    /// Infrastructure errors come back as failed results, never as `Err`.
    pub async fn exec_in_with_env(
        &self,
        workspace_id: &str,
        argv: &[String],
        runtime: &str,
        env: &HashMap<String, String>,
    ) -> CommandResult {
        if argv.is_empty() {
            return CommandResult::infrastructure_failure("Refusing to execute an empty command");
        }

        let _active = ActiveExec::begin(&self.active_execs, workspace_id);
        let request = self.request_for(workspace_id, runtime);
        let handle = match self.get_or_create(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(workspace_id = %workspace_id, error = %e, "Could not obtain workspace container");
                return CommandResult::infrastructure_failure(e.to_string());
            }
        };

        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let exec = self
            .engine
            .exec(&handle.name, argv, &env, &self.config.mount_path)
            .await;
        self.touch(workspace_id);

        match exec {
            Ok(output) => {
                let result = CommandResult::from_exec(output);
                metrics::counter!(
                    "sandbox_exec_total",
                    "outcome" => if result.success { "success" } else { "failure" }
                )
                .increment(1);
                tracing::debug!(
                    workspace_id = %workspace_id,
                    program = %argv[0],
                    exit_code = ?result.exit_code,
                    "Command finished"
                );
                self.maybe_sample_resources(&handle);
                result
            }
            Err(e) => {
                metrics::counter!("sandbox_exec_total", "outcome" => "infrastructure").increment(1);
                tracing::error!(container = %handle.name, error = %e, "Exec failed");
                CommandResult::infrastructure_failure(e.to_string())
            }
        }
    }

    /// With probability `metrics_sample_rate`, read container resource usage
    /// in the background.
    fn maybe_sample_resources(&self, handle: &ContainerHandle) {
        let rate = self.config.metrics_sample_rate;
        if rate.is_nan() || rate <= 0.0 || !rand::thread_rng().gen_bool(rate.min(1.0)) {
            return;
        }

        let engine = self.engine.clone();
        let name = handle.name.clone();
        let workspace_id = handle.workspace_id.clone();
        tokio::spawn(async move {
            match engine.sample_resources(&name).await {
                Ok(sample) => {
                    if let Some(bytes) = sample.memory_bytes {
                        metrics::gauge!("sandbox_container_memory_bytes", "workspace" => workspace_id.clone())
                            .set(bytes as f64);
                    }
                    if let Some(cpu) = sample.cpu_percent {
                        metrics::gauge!("sandbox_container_cpu_percent", "workspace" => workspace_id.clone())
                            .set(cpu);
                    }
                    tracing::info!(
                        workspace_id = %workspace_id,
                        memory_bytes = ?sample.memory_bytes,
                        memory_limit_bytes = ?sample.memory_limit_bytes,
                        cpu_percent = ?sample.cpu_percent,
                        "Container resource sample"
                    );
                }
                Err(e) => tracing::debug!(container = %name, error = %e, "Resource sampling failed"),
            }
        });
    }

    /// Mark the workspace as active now.
    pub fn touch(&self, workspace_id: &str) {
        if let Some(mut record) = self.records.get_mut(workspace_id) {
            record.last_activity_at = Utc::now();
        }
    }

    /// Stop the workspace container. Already stopped or missing is success.
    pub async fn stop(&self, workspace_id: &str) -> Result<()> {
        let name = self.config.container_name(workspace_id);
        match self
            .engine
            .stop_container(&name, self.config.stop_timeout_secs)
            .await
        {
            Ok(()) => tracing::info!(container = %name, "Workspace container stopped"),
            Err(e) if e.is_idempotent_cleanup() => {
                tracing::debug!(container = %name, reason = %e, "Container already stopped")
            }
            Err(e) => {
                tracing::error!(container = %name, error = %e, "Failed to stop container");
                return Err(e);
            }
        }

        if let Some(mut record) = self.records.get_mut(workspace_id) {
            record.status = ContainerStatus::Stopped;
        }
        Ok(())
    }

    /// Remove the workspace container and forget it. Missing is success.
    pub async fn remove(&self, workspace_id: &str) -> Result<()> {
        let name = self.config.container_name(workspace_id);
        match self.engine.remove_container(&name).await {
            Ok(()) => tracing::info!(container = %name, "Workspace container removed"),
            Err(e) if e.is_idempotent_cleanup() => {
                tracing::debug!(container = %name, reason = %e, "Container already gone")
            }
            Err(e) => {
                tracing::error!(container = %name, error = %e, "Failed to remove container");
                return Err(e);
            }
        }

        self.records.remove(workspace_id);
        Ok(())
    }

    pub fn status(&self, workspace_id: &str) -> Option<ContainerRecord> {
        self.records.get(workspace_id).map(|r| r.clone())
    }

    /// Snapshot of every tracked container, ordered by workspace id.
    pub fn records(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id));
        records
    }

    /// Rebuild the registry from containers on the daemon that follow the
    /// naming convention. Returns how many records were recovered.
    pub async fn reconcile(&self) -> Result<usize> {
        let prefix = &self.config.container_prefix;
        let containers = self.engine.list_containers(prefix).await?;
        let now = Utc::now();

        self.records.clear();
        for info in containers {
            let Some(workspace_id) = info.name.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if workspace_id.is_empty() {
                continue;
            }

            let runtime = info
                .labels
                .get(RUNTIME_LABEL)
                .cloned()
                .unwrap_or_else(|| self.config.default_runtime.clone());

            tracing::debug!(container = %info.name, status = %info.status, runtime = %runtime, "Recovered container");
            self.records.insert(
                workspace_id.to_string(),
                ContainerRecord {
                    id: info.id,
                    workspace_id: workspace_id.to_string(),
                    runtime,
                    status: info.status,
                    created_at: info.created_at.unwrap_or(now),
                    // Idle time is measured from the restart, not guessed.
                    last_activity_at: now,
                },
            );
        }

        let recovered = self.records.len();
        tracing::info!(recovered, "Reconciled workspace containers with the daemon");
        Ok(recovered)
    }

    /// Remove containers idle for longer than the configured TTL. Returns the
    /// workspaces whose containers were reclaimed.
    ///
    /// Each candidate is re-checked right before removal; one that saw
    /// activity since the scan, or is running a command, is kept. A container that becomes active after
    /// the re-check but before removal can still be lost.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let ttl = chrono::Duration::from_std(self.config.idle_ttl())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let is_idle = |last_activity: DateTime<Utc>| Utc::now() - last_activity > ttl;

        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|r| is_idle(r.last_activity_at))
            .map(|r| r.workspace_id.clone())
            .collect();

        let mut reclaimed = Vec::new();
        for workspace_id in candidates {
            let name = self.config.container_name(&workspace_id);

            match self.engine.inspect_container(&name).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!(container = %name, "Idle container vanished; forgetting it");
                    self.records.remove(&workspace_id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "Skipping idle candidate; inspect failed");
                    continue;
                }
            }

            let still_idle = self
                .records
                .get(&workspace_id)
                .map(|r| is_idle(r.last_activity_at))
                .unwrap_or(false);
            let busy = self.in_flight.lock().await.contains_key(&workspace_id)
                || self.active_execs.contains_key(&workspace_id);
            if !still_idle || busy {
                tracing::debug!(container = %name, "Container became active; keeping it");
                continue;
            }

            match self.remove(&workspace_id).await {
                Ok(()) => {
                    metrics::counter!("sandbox_containers_reclaimed_total").increment(1);
                    tracing::info!(container = %name, "Reclaimed idle workspace container");
                    reclaimed.push(workspace_id);
                }
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "Failed to reclaim idle container")
                }
            }
        }

        reclaimed
    }

    /// Start the periodic idle sweep. Calling it twice keeps the first sweeper.
    pub fn start_idle_sweep(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.is_some() {
            return;
        }

        let manager = self.clone();
        let interval = self.config.sweep_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reclaimed = manager.sweep_idle().await;
                if !reclaimed.is_empty() {
                    tracing::info!(count = reclaimed.len(), "Idle sweep finished");
                }
            }
        }));

        tracing::info!(
            interval_secs = interval.as_secs(),
            ttl_secs = self.config.idle_ttl_secs,
            "Idle sweep started"
        );
    }

    pub fn stop_idle_sweep(&self) {
        let handle = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("Idle sweep stopped");
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Stop the sweep and remove every tracked container. Returns how many
    /// were removed.
    pub async fn shutdown_all(&self) -> usize {
        self.stop_idle_sweep();

        let workspaces: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        let mut removed = 0;
        for workspace_id in workspaces {
            match self.remove(&workspace_id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::error!(workspace_id = %workspace_id, error = %e, "Failed to remove container during shutdown")
                }
            }
        }

        tracing::info!(removed, "All workspace containers removed");
        removed
    }

    #[cfg(test)]
    fn set_last_activity(&self, workspace_id: &str, at: DateTime<Utc>) {
        if let Some(mut record) = self.records.get_mut(workspace_id) {
            record.last_activity_at = at;
        }
    }
}

fn infrastructure(err: Error) -> Error {
    match err {
        Error::Infrastructure(_) => err,
        other => Error::infrastructure(other.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================
