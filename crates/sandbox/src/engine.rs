//! Container runtime engine.
//!
//! This module provides the `ContainerEngine` trait, the seam between the
//! lifecycle manager and the container daemon, with a Docker implementation
//! built on the `bollard` crate and an in-memory mock for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use devbox_core::{Error, Result};

// =============================================================================
// Engine Types
// =============================================================================

/// Lifecycle state of a container as the lifecycle manager tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything the engine needs to create a workspace container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// Docker-style `host:container` bind mounts.
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub working_dir: String,
}

/// Live view of a container on the daemon.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    /// Name without Docker's leading `/`.
    pub name: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Raw result of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the daemon did not report an exit code.
    pub exit_code: Option<i64>,
    /// Combined stdout and stderr in arrival order.
    pub output: String,
}

impl ExecOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: output.into(),
        }
    }
}

/// One point-in-time resource reading.
#[derive(Debug, Clone, Default)]
pub struct ResourceSample {
    pub memory_bytes: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
}

// =============================================================================
// Container Engine Trait
// =============================================================================

/// Trait for container runtime backends.
///
/// Implementations report "no such container" as `Error::ContainerNotFound`
/// and "already stopped" as `Error::ContainerNotRunning`; everything else
/// is `Error::Infrastructure`.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check if the daemon is reachable.
    async fn ping(&self) -> bool;

    /// Whether the image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image and wait until the pull has completed.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, name: &str) -> Result<()>;

    /// Inspect a container by name; `None` if it does not exist.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>>;

    /// All containers, running or not, whose name starts with `name_prefix`.
    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>>;

    /// Run `argv` inside the container and wait for the output stream to end.
    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        env: &[String],
        working_dir: &str,
    ) -> Result<ExecOutput>;

    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<()>;

    /// Force-remove a container.
    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn sample_resources(&self, name: &str) -> Result<ResourceSample>;
}

// =============================================================================
// Docker Engine Implementation
// =============================================================================

/// Docker-based engine using the `bollard` crate.
pub struct DockerEngine {
    docker: bollard::Docker,
}

impl DockerEngine {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::infrastructure(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker })
    }

    /// Create from an existing bollard Docker client.
    pub fn from_client(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

fn docker_error(operation: &str, target: &str, err: bollard::errors::Error) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::ContainerNotFound(target.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        } => Error::ContainerNotRunning(target.to_string()),
        other => Error::infrastructure(format!("Failed to {} '{}': {}", operation, target, other)),
    }
}

fn status_from_state(state: Option<&str>) -> ContainerStatus {
    match state {
        Some("running") | Some("restarting") => ContainerStatus::Running,
        Some("created") => ContainerStatus::Created,
        Some("exited") | Some("paused") | Some("removing") => ContainerStatus::Stopped,
        _ => ContainerStatus::Error,
    }
}

/// Split `repo:tag`, leaving registry ports (`host:5000/repo`) alone.
fn split_image_reference(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(docker_error("inspect image", image, e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        use bollard::image::CreateImageOptions;
        use futures::TryStreamExt;

        let (from_image, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        // The pull is only complete once the progress stream is exhausted.
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| Error::infrastructure(format!("Failed to pull image '{}': {}", image, e)))?;

        tracing::info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            binds: Some(spec.binds.clone()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(false),
            host_config: Some(host_config),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: &spec.name,
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                Error::infrastructure(format!("Failed to create container '{}': {}", spec.name, e))
            })?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "Docker warning on create");
        }

        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| docker_error("start container", name, e))
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        use bollard::container::InspectContainerOptions;

        let response = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(docker_error("inspect container", name, e)),
        };

        let state = response
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|status| status.to_string());

        Ok(Some(ContainerInfo {
            id: response.id.unwrap_or_default(),
            name: name.to_string(),
            status: status_from_state(state.as_deref()),
            labels: response
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
            created_at: response
                .created
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|c| c.with_timezone(&Utc)),
        }))
    }

    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
        use bollard::container::ListContainersOptions;

        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![name_prefix.to_string()])]),
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| docker_error("list containers", name_prefix, e))?;

        // The daemon's name filter is a substring match; keep true prefixes only.
        let containers = summaries
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .as_ref()?
                    .iter()
                    .map(|n| n.trim_start_matches('/'))
                    .find(|n| n.starts_with(name_prefix))?
                    .to_string();
                Some(ContainerInfo {
                    id: summary.id.unwrap_or_default(),
                    name,
                    status: status_from_state(summary.state.as_deref()),
                    labels: summary.labels.unwrap_or_default(),
                    created_at: summary
                        .created
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
                })
            })
            .collect();

        Ok(containers)
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        env: &[String],
        working_dir: &str,
    ) -> Result<ExecOutput> {
        use bollard::container::LogOutput;
        use bollard::exec::{CreateExecOptions, StartExecResults};
        use futures::StreamExt;

        let exec_options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            env: Some(env.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(working_dir.to_string()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(name, exec_options)
            .await
            .map_err(|e| docker_error("create exec in", name, e))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_error("start exec in", name, e))?;

        let mut output = String::new();

        if let StartExecResults::Attached { output: mut stream, .. } = start_result {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        output.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        return Err(Error::infrastructure(format!(
                            "Output stream from '{}' broke: {}",
                            name, e
                        )));
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| docker_error("inspect exec in", name, e))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            output,
        })
    }

    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<()> {
        use bollard::container::StopContainerOptions;

        self.docker
            .stop_container(name, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(|e| docker_error("stop container", name, e))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        use bollard::container::RemoveContainerOptions;

        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| docker_error("remove container", name, e))
    }

    async fn sample_resources(&self, name: &str) -> Result<ResourceSample> {
        use bollard::container::StatsOptions;
        use futures::StreamExt;

        let mut stream = Box::pin(self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        ));

        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(docker_error("read stats of", name, e)),
            None => return Ok(ResourceSample::default()),
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1);
        let cpu_percent = (system_delta > 0)
            .then(|| cpu_delta as f64 / system_delta as f64 * cpus as f64 * 100.0);

        Ok(ResourceSample {
            memory_bytes: stats.memory_stats.usage,
            memory_limit_bytes: stats.memory_stats.limit,
            cpu_percent,
        })
    }
}

// =============================================================================
// Mock Engine (for testing without Docker)
// =============================================================================

/// Scripted response for commands run through [`MockEngine`].
pub type ExecResponder = Box<dyn Fn(&str, &[String]) -> ExecOutput + Send + Sync>;

/// Callback fired on every [`MockEngine::inspect_container`] call.
pub type InspectHook = Box<dyn Fn(&str) + Send + Sync>;

/// One command the mock was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub container: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    status: ContainerStatus,
    labels: HashMap<String, String>,
    spec: Option<ContainerSpec>,
}

/// In-memory container daemon for unit testing.
///
/// Without a responder, `which <tool>` succeeds, `echo` prints its arguments
/// joined by spaces, and anything else exits 0 with no output.
pub struct MockEngine {
    containers: Mutex<HashMap<String, MockContainer>>,
    images: Mutex<HashSet<String>>,
    responder: Mutex<Option<ExecResponder>>,
    inspect_hook: Mutex<Option<InspectHook>>,
    exec_log: Mutex<Vec<ExecCall>>,
    create_delay: Mutex<Duration>,
    exec_delay: Mutex<Duration>,
    create_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    start_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    next_id: AtomicUsize,
    fail_create: AtomicBool,
    available: AtomicBool,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            containers: Mutex::default(),
            images: Mutex::default(),
            responder: Mutex::default(),
            inspect_hook: Mutex::default(),
            exec_log: Mutex::default(),
            create_delay: Mutex::new(Duration::ZERO),
            exec_delay: Mutex::new(Duration::ZERO),
            create_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            fail_create: AtomicBool::new(false),
            available: AtomicBool::new(true),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn default_response(argv: &[String]) -> ExecOutput {
    match argv.first().map(String::as_str) {
        Some("which") => ExecOutput::ok(format!(
            "/usr/bin/{}\n",
            argv.get(1).map(String::as_str).unwrap_or_default()
        )),
        Some("echo") => ExecOutput::ok(format!("{}\n", argv[1..].join(" "))),
        _ => ExecOutput::ok(""),
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every exec with `responder(container, argv)`.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str, &[String]) -> ExecOutput + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
        self
    }

    /// Make `create_container` sleep, widening any race window under test.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *lock(&self.create_delay) = delay;
        self
    }

    /// Make every exec take `delay` to finish. Removing the container in the
    /// meantime fails the exec, as it does on a real daemon.
    pub fn with_exec_delay(self, delay: Duration) -> Self {
        *lock(&self.exec_delay) = delay;
        self
    }

    pub fn set_inspect_hook<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *lock(&self.inspect_hook) = Some(Box::new(hook));
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Pretend a container already exists on the daemon.
    pub fn seed_container(&self, name: &str, status: ContainerStatus, labels: HashMap<String, String>) {
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.containers).insert(
            name.to_string(),
            MockContainer {
                id,
                status,
                labels,
                spec: None,
            },
        );
    }

    /// Simulate the container process dying out from under the manager.
    pub fn crash(&self, name: &str) {
        if let Some(container) = lock(&self.containers).get_mut(name) {
            container.status = ContainerStatus::Stopped;
        }
    }

    pub fn add_image(&self, image: &str) {
        lock(&self.images).insert(image.to_string());
    }

    pub fn status_of(&self, name: &str) -> Option<ContainerStatus> {
        lock(&self.containers).get(name).map(|c| c.status)
    }

    pub fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        lock(&self.containers).get(name).and_then(|c| c.spec.clone())
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.containers).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        lock(&self.exec_log).clone()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(lock(&self.images).contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.images).insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::infrastructure(format!(
                "Failed to create container '{}': mock failure",
                spec.name
            )));
        }

        let mut containers = lock(&self.containers);
        if containers.contains_key(&spec.name) {
            return Err(Error::infrastructure(format!(
                "Conflict: container name '{}' is already in use",
                spec.name
            )));
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                status: ContainerStatus::Created,
                labels: spec.labels.clone(),
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.containers).get_mut(name) {
            Some(container) => {
                container.status = ContainerStatus::Running;
                Ok(())
            }
            None => Err(Error::ContainerNotFound(name.to_string())),
        }
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        if let Some(hook) = lock(&self.inspect_hook).as_ref() {
            hook(name);
        }
        Ok(lock(&self.containers).get(name).map(|c| ContainerInfo {
            id: c.id.clone(),
            name: name.to_string(),
            status: c.status,
            labels: c.labels.clone(),
            created_at: None,
        }))
    }

    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
        let mut containers: Vec<ContainerInfo> = lock(&self.containers)
            .iter()
            .filter(|(name, _)| name.starts_with(name_prefix))
            .map(|(name, c)| ContainerInfo {
                id: c.id.clone(),
                name: name.clone(),
                status: c.status,
                labels: c.labels.clone(),
                created_at: None,
            })
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        env: &[String],
        _working_dir: &str,
    ) -> Result<ExecOutput> {
        match lock(&self.containers).get(name).map(|c| c.status) {
            Some(ContainerStatus::Running) => {}
            Some(_) => return Err(Error::ContainerNotRunning(name.to_string())),
            None => return Err(Error::ContainerNotFound(name.to_string())),
        }

        lock(&self.exec_log).push(ExecCall {
            container: name.to_string(),
            argv: argv.to_vec(),
            env: env.to_vec(),
        });

        let delay = *lock(&self.exec_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            if !lock(&self.containers).contains_key(name) {
                return Err(Error::ContainerNotFound(name.to_string()));
            }
        }

        Ok(match lock(&self.responder).as_ref() {
            Some(responder) => responder(name, argv),
            None => default_response(argv),
        })
    }

    async fn stop_container(&self, name: &str, _timeout_secs: i64) -> Result<()> {
        match lock(&self.containers).get_mut(name) {
            Some(c) if c.status == ContainerStatus::Running => {
                c.status = ContainerStatus::Stopped;
                Ok(())
            }
            Some(_) => Err(Error::ContainerNotRunning(name.to_string())),
            None => Err(Error::ContainerNotFound(name.to_string())),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.containers).remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::ContainerNotFound(name.to_string())),
        }
    }

    async fn sample_resources(&self, name: &str) -> Result<ResourceSample> {
        match lock(&self.containers).get(name) {
            Some(_) => Ok(ResourceSample {
                memory_bytes: Some(64 * 1024 * 1024),
                memory_limit_bytes: Some(512 * 1024 * 1024),
                cpu_percent: Some(1.5),
            }),
            None => Err(Error::ContainerNotFound(name.to_string())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_status_from_docker_state() {
        assert_eq!(status_from_state(Some("running")), ContainerStatus::Running);
        assert_eq!(status_from_state(Some("created")), ContainerStatus::Created);
        assert_eq!(status_from_state(Some("exited")), ContainerStatus::Stopped);
        assert_eq!(status_from_state(Some("dead")), ContainerStatus::Error);
        assert_eq!(status_from_state(None), ContainerStatus::Error);
    }

    #[test]
    fn test_split_image_reference() {
        assert_eq!(split_image_reference("python:3.11-slim"), ("python", "3.11-slim"));
        assert_eq!(split_image_reference("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(
            split_image_reference("registry:5000/team/img"),
            ("registry:5000/team/img", "latest")
        );
        assert_eq!(
            split_image_reference("registry:5000/team/img:v2"),
            ("registry:5000/team/img", "v2")
        );
    }

    #[tokio::test]
    async fn test_mock_engine_lifecycle() {
        let mock = MockEngine::new();
        let spec = ContainerSpec {
            name: "devbox-ws-a".into(),
            image: "img".into(),
            labels: HashMap::new(),
            binds: vec![],
            memory_bytes: 1,
            nano_cpus: 1,
            working_dir: "/workspace".into(),
        };

        let id = mock.create_container(&spec).await.unwrap();
        let info = mock.inspect_container("devbox-ws-a").await.unwrap().unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.status, ContainerStatus::Created);

        // Not running yet
        let err = mock
            .exec("devbox-ws-a", &argv(&["echo", "hi"]), &[], "/workspace")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContainerNotRunning(_)));

        mock.start_container("devbox-ws-a").await.unwrap();
        let out = mock
            .exec("devbox-ws-a", &argv(&["echo", "hi", "there"]), &[], "/workspace")
            .await
            .unwrap();
        assert_eq!(out, ExecOutput::ok("hi there\n"));

        mock.stop_container("devbox-ws-a", 5).await.unwrap();
        assert!(matches!(
            mock.stop_container("devbox-ws-a", 5).await,
            Err(Error::ContainerNotRunning(_))
        ));

        mock.remove_container("devbox-ws-a").await.unwrap();
        assert!(matches!(
            mock.remove_container("devbox-ws-a").await,
            Err(Error::ContainerNotFound(_))
        ));
        assert!(mock.inspect_container("devbox-ws-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_engine_responder() {
        let mock = MockEngine::new().with_responder(|_, argv| {
            if argv[0] == "gcc" {
                ExecOutput::failed(1, "main.c:1: error")
            } else {
                ExecOutput::ok("fine")
            }
        });
        mock.seed_container("c", ContainerStatus::Running, HashMap::new());

        let out = mock.exec("c", &argv(&["gcc", "x.c"]), &[], "/").await.unwrap();
        assert_eq!(out.exit_code, Some(1));
        let out = mock.exec("c", &argv(&["ls"]), &[], "/").await.unwrap();
        assert_eq!(out.output, "fine");
        assert_eq!(mock.exec_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_list_filters_by_prefix() {
        let mock = MockEngine::new();
        mock.seed_container("devbox-ws-1", ContainerStatus::Running, HashMap::new());
        mock.seed_container("devbox-ws-2", ContainerStatus::Stopped, HashMap::new());
        mock.seed_container("postgres", ContainerStatus::Running, HashMap::new());

        let listed = mock.list_containers("devbox-ws-").await.unwrap();
        let names: Vec<_> = listed.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["devbox-ws-1", "devbox-ws-2"]);
    }
}
