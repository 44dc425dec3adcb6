//! Sandbox facade.
//!
//! The one entry point external callers use. A backend is chosen once at
//! process start: the container-backed [`ContainerSandbox`] when a daemon is
//! reachable, otherwise the deterministic [`SimulatedSandbox`]. Both honor
//! the same [`Sandbox`] contract, so callers never branch on the backend.

use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use devbox_core::{BackendKind, Error, FileStore, Result, SandboxConfig};

use crate::capability::{CapabilityRegistry, DetectionContext};
use crate::dispatcher::{Dispatcher, ExecutionOutcome, ExecutionRequest, Stage, StageResult};
use crate::engine::{ContainerEngine, DockerEngine};
use crate::lifecycle::{CommandResult, LifecycleManager};

/// Receives output as it becomes available.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

// =============================================================================
// Package Managers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
    Pip,
    Gem,
    Cargo,
    Go,
    Composer,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
            Self::Pip => "pip",
            Self::Gem => "gem",
            Self::Cargo => "cargo",
            Self::Go => "go",
            Self::Composer => "composer",
        }
    }

    /// Runtime whose image carries this manager.
    pub fn runtime(&self) -> &'static str {
        match self {
            Self::Npm | Self::Yarn | Self::Pnpm => "node",
            Self::Pip => "python",
            Self::Gem => "ruby",
            Self::Cargo => "rust",
            Self::Go => "go",
            Self::Composer => "php",
        }
    }

    fn install_verb(&self) -> &'static [&'static str] {
        match self {
            Self::Npm => &["npm", "install"],
            Self::Yarn => &["yarn", "add"],
            Self::Pnpm => &["pnpm", "add"],
            Self::Pip => &["pip", "install"],
            Self::Gem => &["gem", "install"],
            Self::Cargo => &["cargo", "add"],
            Self::Go => &["go", "get"],
            Self::Composer => &["composer", "require"],
        }
    }

    /// Argv installing `packages`. Names are passed as literal arguments and
    /// may not look like flags.
    pub fn install_command(&self, packages: &[String]) -> Result<Vec<String>> {
        if packages.is_empty() {
            return Err(Error::invalid_request("No packages to install"));
        }
        if let Some(bad) = packages
            .iter()
            .find(|p| p.trim().is_empty() || p.starts_with('-'))
        {
            return Err(Error::invalid_request(format!("Invalid package name: '{}'", bad)));
        }

        let mut argv: Vec<String> = self.install_verb().iter().map(|s| s.to_string()).collect();
        argv.extend(packages.iter().cloned());
        Ok(argv)
    }
}

impl FromStr for PackageManager {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npm" => Ok(Self::Npm),
            "yarn" => Ok(Self::Yarn),
            "pnpm" => Ok(Self::Pnpm),
            "pip" | "pip3" => Ok(Self::Pip),
            "gem" => Ok(Self::Gem),
            "cargo" => Ok(Self::Cargo),
            "go" => Ok(Self::Go),
            "composer" => Ok(Self::Composer),
            other => Err(Error::invalid_request(format!(
                "Unsupported package manager: '{}'",
                other
            ))),
        }
    }
}

fn invalid(err: Error) -> CommandResult {
    CommandResult {
        success: false,
        output: String::new(),
        error: Some(err.to_string()),
        exit_code: None,
    }
}

// =============================================================================
// Sandbox Trait
// =============================================================================

/// The stable contract every backend implements.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Prepare the backend for traffic.
    async fn initialize(&self) -> Result<()>;

    /// Release everything the backend holds.
    async fn shutdown(&self) -> Result<()>;

    /// Run a shell string via `/bin/bash -c`.
    ///
    /// Shell metacharacters are interpreted. Callers assembling commands from
    /// untrusted fragments must use [`execute_command_argv`](Self::execute_command_argv).
    async fn execute_command(&self, command: &str, workspace_id: &str) -> CommandResult;

    /// Run `argv` with no shell interpretation.
    async fn execute_command_argv(&self, argv: &[String], workspace_id: &str) -> CommandResult;

    async fn execute_file(
        &self,
        path: &str,
        workspace_id: &str,
        language_hint: Option<&str>,
    ) -> ExecutionOutcome;

    /// Like [`execute_file`](Self::execute_file) with full request options.
    async fn execute_request(&self, request: &ExecutionRequest) -> ExecutionOutcome;

    /// Install missing manifest dependencies first, then run the file.
    async fn execute_with_bootstrap(&self, request: &ExecutionRequest) -> ExecutionOutcome;

    async fn install_packages(
        &self,
        packages: &[String],
        manager: &str,
        workspace_id: &str,
    ) -> CommandResult;

    async fn execute_command_streaming(
        &self,
        command: &str,
        workspace_id: &str,
        sink: OutputSink,
    ) -> CommandResult {
        let result = self.execute_command(command, workspace_id).await;
        emit(&sink, &result.output);
        result
    }

    async fn execute_file_streaming(
        &self,
        path: &str,
        workspace_id: &str,
        language_hint: Option<&str>,
        sink: OutputSink,
    ) -> ExecutionOutcome {
        let outcome = self.execute_file(path, workspace_id, language_hint).await;
        emit(&sink, &outcome.output);
        outcome
    }

    async fn install_packages_streaming(
        &self,
        packages: &[String],
        manager: &str,
        workspace_id: &str,
        sink: OutputSink,
    ) -> CommandResult {
        let result = self.install_packages(packages, manager, workspace_id).await;
        emit(&sink, &result.output);
        result
    }
}

fn emit(sink: &OutputSink, output: &str) {
    if !output.is_empty() {
        sink(output);
    }
}

// =============================================================================
// Container-backed Sandbox
// =============================================================================

/// Sandbox running everything in per-workspace containers.
pub struct ContainerSandbox {
    lifecycle: LifecycleManager,
    dispatcher: Dispatcher,
}

impl ContainerSandbox {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: SandboxConfig,
        files: Arc<dyn FileStore>,
    ) -> Self {
        let registry = Arc::new(CapabilityRegistry::new(config.build_root.clone()));
        let lifecycle = LifecycleManager::new(engine, config);
        let dispatcher = Dispatcher::new(lifecycle.clone(), registry, files);
        Self {
            lifecycle,
            dispatcher,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn initialize(&self) -> Result<()> {
        let recovered = self.lifecycle.reconcile().await?;
        self.lifecycle.start_idle_sweep();
        tracing::info!(recovered, "Container sandbox initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let removed = self.lifecycle.shutdown_all().await;
        tracing::info!(removed, "Container sandbox shut down");
        Ok(())
    }

    async fn execute_command(&self, command: &str, workspace_id: &str) -> CommandResult {
        let argv = vec!["/bin/bash".to_string(), "-c".to_string(), command.to_string()];
        self.execute_command_argv(&argv, workspace_id).await
    }

    async fn execute_command_argv(&self, argv: &[String], workspace_id: &str) -> CommandResult {
        let runtime = self.lifecycle.config().default_runtime.clone();
        self.lifecycle.exec_in(workspace_id, argv, &runtime).await
    }

    async fn execute_file(
        &self,
        path: &str,
        workspace_id: &str,
        language_hint: Option<&str>,
    ) -> ExecutionOutcome {
        let mut request = ExecutionRequest::new(workspace_id, path);
        request.language_hint = language_hint.map(str::to_string);
        self.dispatcher.execute_file(&request).await
    }

    async fn execute_request(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        self.dispatcher.execute_file(request).await
    }

    async fn execute_with_bootstrap(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        self.dispatcher.execute_with_bootstrap(request).await
    }

    async fn install_packages(
        &self,
        packages: &[String],
        manager: &str,
        workspace_id: &str,
    ) -> CommandResult {
        let manager = match manager.parse::<PackageManager>() {
            Ok(manager) => manager,
            Err(e) => return invalid(e),
        };
        let argv = match manager.install_command(packages) {
            Ok(argv) => argv,
            Err(e) => return invalid(e),
        };

        tracing::info!(
            workspace_id,
            manager = manager.as_str(),
            count = packages.len(),
            "Installing packages"
        );
        self.lifecycle
            .exec_in(workspace_id, &argv, manager.runtime())
            .await
    }
}

// =============================================================================
// Simulated Sandbox
// =============================================================================

/// Sandbox that executes nothing and answers deterministically.
///
/// Streaming variants replay the payload in fixed-size chunks with a short
/// delay so streaming callers behave the same on either backend.
pub struct SimulatedSandbox {
    registry: CapabilityRegistry,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl SimulatedSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            registry: CapabilityRegistry::new(config.build_root.clone()),
            chunk_size: config.simulated_chunk_size.max(1),
            chunk_delay: Duration::from_millis(config.simulated_chunk_delay_ms),
        }
    }

    fn ok(output: String) -> CommandResult {
        CommandResult {
            success: true,
            output,
            error: None,
            exit_code: Some(0),
        }
    }

    async fn replay(&self, sink: &OutputSink, output: &str) {
        let chars: Vec<char> = output.chars().collect();
        for (i, chunk) in chars.chunks(self.chunk_size).enumerate() {
            if i > 0 && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            let chunk: String = chunk.iter().collect();
            sink(&chunk);
        }
    }
}

#[async_trait]
impl Sandbox for SimulatedSandbox {
    fn backend(&self) -> &'static str {
        "simulated"
    }

    async fn initialize(&self) -> Result<()> {
        tracing::info!("Simulated sandbox initialized; commands will not be executed");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_command(&self, command: &str, workspace_id: &str) -> CommandResult {
        tracing::debug!(workspace_id, command, "Simulating shell command");
        Self::ok(format!("[simulated] $ {}\n", command))
    }

    async fn execute_command_argv(&self, argv: &[String], workspace_id: &str) -> CommandResult {
        tracing::debug!(workspace_id, argv = ?argv, "Simulating command");
        Self::ok(format!("[simulated] $ {}\n", argv.join(" ")))
    }

    async fn execute_file(
        &self,
        path: &str,
        workspace_id: &str,
        language_hint: Option<&str>,
    ) -> ExecutionOutcome {
        let mut request = ExecutionRequest::new(workspace_id, path);
        request.language_hint = language_hint.map(str::to_string);
        self.execute_request(&request).await
    }

    async fn execute_request(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let ctx = DetectionContext {
            file_path: &request.file_path,
            language_hint: request.language_hint.as_deref(),
            ..Default::default()
        };
        let language = self.registry.detect(&ctx).map(|c| c.id.to_string());
        let output = format!("[simulated] executed {}\n", request.file_path);

        tracing::debug!(workspace_id = %request.workspace_id, path = %request.file_path, "Simulating file execution");
        ExecutionOutcome {
            success: true,
            output: output.clone(),
            error: None,
            exit_code: Some(0),
            language,
            failure: None,
            stages: vec![StageResult {
                stage: Stage::Execution,
                success: true,
                output,
                error: None,
                duration_ms: 0,
            }],
            total_duration_ms: 0,
        }
    }

    async fn execute_with_bootstrap(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        self.execute_request(request).await
    }

    async fn install_packages(
        &self,
        packages: &[String],
        manager: &str,
        workspace_id: &str,
    ) -> CommandResult {
        let manager = match manager.parse::<PackageManager>() {
            Ok(manager) => manager,
            Err(e) => return invalid(e),
        };
        if let Err(e) = manager.install_command(packages) {
            return invalid(e);
        }

        tracing::debug!(workspace_id, manager = manager.as_str(), "Simulating package install");
        Self::ok(format!(
            "[simulated] {} installed {}\n",
            manager.as_str(),
            packages.join(" ")
        ))
    }

    async fn execute_command_streaming(
        &self,
        command: &str,
        workspace_id: &str,
        sink: OutputSink,
    ) -> CommandResult {
        let result = self.execute_command(command, workspace_id).await;
        self.replay(&sink, &result.output).await;
        result
    }

    async fn execute_file_streaming(
        &self,
        path: &str,
        workspace_id: &str,
        language_hint: Option<&str>,
        sink: OutputSink,
    ) -> ExecutionOutcome {
        let outcome = self.execute_file(path, workspace_id, language_hint).await;
        self.replay(&sink, &outcome.output).await;
        outcome
    }

    async fn install_packages_streaming(
        &self,
        packages: &[String],
        manager: &str,
        workspace_id: &str,
        sink: OutputSink,
    ) -> CommandResult {
        let result = self.install_packages(packages, manager, workspace_id).await;
        self.replay(&sink, &result.output).await;
        result
    }
}

// =============================================================================
// Backend Selection
// =============================================================================

/// Choose the backend once for the life of the process.
///
/// With `BackendKind::Auto` the local Docker daemon is probed a single time;
/// an unreachable daemon selects the simulated backend.
pub async fn select_sandbox(config: &SandboxConfig, files: Arc<dyn FileStore>) -> Result<Arc<dyn Sandbox>> {
    if config.backend == BackendKind::Simulated {
        tracing::info!("Using simulated sandbox backend");
        return Ok(Arc::new(SimulatedSandbox::new(config)));
    }
    let engine = DockerEngine::new().map(|e| Arc::new(e) as Arc<dyn ContainerEngine>);
    choose_backend(config, engine, files).await
}

/// Selection logic given an already-connected (or failed) engine.
pub async fn choose_backend(
    config: &SandboxConfig,
    engine: Result<Arc<dyn ContainerEngine>>,
    files: Arc<dyn FileStore>,
) -> Result<Arc<dyn Sandbox>> {
    if config.backend == BackendKind::Simulated {
        tracing::info!("Using simulated sandbox backend");
        return Ok(Arc::new(SimulatedSandbox::new(config)));
    }

    let reachable = match engine {
        Ok(engine) if engine.ping().await => Ok(engine),
        Ok(_) => Err(Error::infrastructure("Container daemon did not answer ping")),
        Err(e) => Err(e),
    };

    match (reachable, config.backend) {
        (Ok(engine), _) => {
            tracing::info!("Using container sandbox backend");
            Ok(Arc::new(ContainerSandbox::new(engine, config.clone(), files)))
        }
        (Err(e), BackendKind::Docker) => {
            tracing::error!(error = %e, "Container backend required but unavailable");
            Err(e)
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Container daemon unavailable; falling back to simulated sandbox");
            Ok(Arc::new(SimulatedSandbox::new(config)))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use devbox_core::mocks::InMemoryFileStore;
    use std::sync::Mutex;

    fn config() -> SandboxConfig {
        SandboxConfig {
            metrics_sample_rate: 0.0,
            simulated_chunk_size: 4,
            simulated_chunk_delay_ms: 1,
            ..SandboxConfig::default()
        }
    }

    fn collecting_sink() -> (OutputSink, Arc<Mutex<Vec<String>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let captured = chunks.clone();
        let sink: OutputSink = Arc::new(move |chunk: &str| captured.lock().unwrap().push(chunk.to_string()));
        (sink, chunks)
    }

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_package_manager_parsing() {
        assert_eq!("NPM".parse::<PackageManager>().unwrap(), PackageManager::Npm);
        assert_eq!("pip3".parse::<PackageManager>().unwrap(), PackageManager::Pip);
        assert!("brew".parse::<PackageManager>().is_err());
    }

    #[test]
    fn test_install_command_rejects_flags() {
        let npm = PackageManager::Npm;
        assert_eq!(
            npm.install_command(&strings(&["left-pad", "lodash"])).unwrap(),
            strings(&["npm", "install", "left-pad", "lodash"])
        );
        assert!(npm.install_command(&strings(&["--global"])).is_err());
        assert!(npm.install_command(&[]).is_err());
        assert_eq!(
            PackageManager::Composer
                .install_command(&strings(&["monolog/monolog"]))
                .unwrap(),
            strings(&["composer", "require", "monolog/monolog"])
        );
    }

    #[tokio::test]
    async fn test_simulated_install_mentions_package() {
        let sandbox = SimulatedSandbox::new(&config());
        let result = sandbox
            .install_packages(&strings(&["left-pad"]), "npm", "ws")
            .await;
        assert!(result.success);
        assert!(result.output.contains("left-pad"));

        let rejected = sandbox.install_packages(&strings(&["x"]), "brew", "ws").await;
        assert!(!rejected.success);
    }

    #[tokio::test]
    async fn test_simulated_streaming_replays_in_chunks() {
        let sandbox = SimulatedSandbox::new(&config());
        let (sink, chunks) = collecting_sink();

        let result = sandbox.execute_command_streaming("echo hello", "ws", sink).await;

        let chunks = chunks.lock().unwrap().clone();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
        assert_eq!(chunks.concat(), result.output);
    }

    #[tokio::test]
    async fn test_simulated_file_detects_language() {
        let sandbox = SimulatedSandbox::new(&config());
        let outcome = sandbox.execute_file("main.go", "ws", None).await;
        assert!(outcome.success);
        assert_eq!(outcome.language.as_deref(), Some("go"));
        assert_eq!(outcome.stages.len(), 1);
    }

    #[tokio::test]
    async fn test_container_argv_is_not_shell_interpreted() {
        let engine = Arc::new(MockEngine::new());
        let sandbox = ContainerSandbox::new(engine.clone(), config(), Arc::new(InMemoryFileStore::new()));

        let result = sandbox
            .execute_command_argv(&strings(&["echo", "a b; rm -rf /"]), "ws")
            .await;
        assert!(result.success);
        assert_eq!(result.output, "a b; rm -rf /\n");

        sandbox.execute_command("echo a b; rm -rf /", "ws").await;

        let calls = engine.exec_calls();
        assert_eq!(calls[0].argv, strings(&["echo", "a b; rm -rf /"]));
        assert_eq!(calls[1].argv, strings(&["/bin/bash", "-c", "echo a b; rm -rf /"]));
    }

    #[tokio::test]
    async fn test_container_install_uses_manager_runtime() {
        let engine = Arc::new(MockEngine::new());
        let mut config = config();
        config.images.insert("node".into(), "node:20-slim".into());
        let sandbox = ContainerSandbox::new(engine.clone(), config, Arc::new(InMemoryFileStore::new()));

        let result = sandbox
            .install_packages(&strings(&["left-pad"]), "npm", "ws")
            .await;

        assert!(result.success);
        assert_eq!(engine.spec_of("devbox-ws-ws").unwrap().image, "node:20-slim");
        assert_eq!(engine.exec_calls()[0].argv, strings(&["npm", "install", "left-pad"]));

        let rejected = sandbox
            .install_packages(&strings(&["-rf"]), "npm", "ws")
            .await;
        assert!(!rejected.success);
        assert_eq!(engine.exec_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_container_streaming_delivers_final_output_once() {
        let engine = Arc::new(MockEngine::new());
        let sandbox = ContainerSandbox::new(engine, config(), Arc::new(InMemoryFileStore::new()));
        let (sink, chunks) = collecting_sink();

        sandbox
            .execute_command_streaming("echo hi", "ws", sink)
            .await;

        // The mock answers `/bin/bash -c ...` with no output.
        assert!(chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let engine = Arc::new(MockEngine::new());
        engine.seed_container("devbox-ws-old", crate::engine::ContainerStatus::Running, Default::default());
        let sandbox = ContainerSandbox::new(engine.clone(), config(), Arc::new(InMemoryFileStore::new()));

        sandbox.initialize().await.unwrap();
        assert_eq!(sandbox.lifecycle().records().len(), 1);
        assert!(sandbox.lifecycle().is_sweeping());

        sandbox.shutdown().await.unwrap();
        assert!(engine.container_names().is_empty());
        assert!(!sandbox.lifecycle().is_sweeping());
    }

    #[tokio::test]
    async fn test_backend_selection() {
        let files: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());

        let up = Arc::new(MockEngine::new());
        let chosen = choose_backend(&config(), Ok(up as Arc<dyn ContainerEngine>), files.clone()).await.unwrap();
        assert_eq!(chosen.backend(), "docker");

        let down = Arc::new(MockEngine::new());
        down.set_available(false);
        let chosen = choose_backend(&config(), Ok(down.clone() as Arc<dyn ContainerEngine>), files.clone()).await.unwrap();
        assert_eq!(chosen.backend(), "simulated");

        let strict = SandboxConfig {
            backend: BackendKind::Docker,
            ..config()
        };
        assert!(choose_backend(&strict, Ok(down as Arc<dyn ContainerEngine>), files.clone()).await.is_err());

        let simulated = SandboxConfig {
            backend: BackendKind::Simulated,
            ..config()
        };
        let chosen = select_sandbox(&simulated, files).await.unwrap();
        assert_eq!(chosen.backend(), "simulated");
    }
}
