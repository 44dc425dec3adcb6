//! Execution dispatcher.
//!
//! Turns "run this file in that workspace" into a staged pipeline:
//! detection, tool validation, then an interpreter, compile-run, or script
//! strategy. Every failure comes back as a fully-formed
//! [`ExecutionOutcome`]; nothing in the pipeline returns `Err`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use devbox_core::fs_policy::{container_path, normalize_workspace_path};
use devbox_core::{Error, FileStore};

use crate::capability::{BuildContext, Capability, CapabilityRegistry, DetectionContext, ExecutionMode};
use crate::lifecycle::{CommandResult, LifecycleManager};

// =============================================================================
// Request and Outcome Types
// =============================================================================

/// One file execution request.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub workspace_id: String,
    /// Workspace-relative path of the file to run.
    pub file_path: String,
    pub language_hint: Option<String>,
    /// Upper bound on each stage. `None` waits for as long as the command runs.
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
    /// Overrides the default script of a script-mode language.
    pub script: Option<String>,
}

impl ExecutionRequest {
    pub fn new(workspace_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    pub fn with_language_hint(mut self, hint: impl Into<String>) -> Self {
        self.language_hint = Some(hint.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Detection,
    Compilation,
    Execution,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Compilation => "compilation",
            Self::Execution => "execution",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: Stage,
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedLanguage,
    MissingTool,
    CompilationFailure,
    RuntimeFailure,
    InfrastructureFailure,
    Timeout,
    InvalidRequest,
}

impl FailureKind {
    fn from_command(result: &CommandResult, on_exit: FailureKind) -> Self {
        if result.is_infrastructure_failure() {
            Self::InfrastructureFailure
        } else {
            on_exit
        }
    }
}

/// Enhanced result shape: the basic command result plus stage detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub stages: Vec<StageResult>,
    pub total_duration_ms: u64,
}

impl ExecutionOutcome {
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Accumulates stages and produces the outcome.
struct OutcomeBuilder {
    started: Instant,
    language: Option<String>,
    stages: Vec<StageResult>,
}

impl OutcomeBuilder {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            language: None,
            stages: Vec::new(),
        }
    }

    fn push(&mut self, stage: Stage, success: bool, output: String, error: Option<String>, started: Instant) {
        let duration_ms = elapsed_ms(started);
        metrics::histogram!(
            "sandbox_stage_duration_ms",
            "stage" => stage.as_str(),
            "language" => self.language.clone().unwrap_or_else(|| "unknown".to_string())
        )
        .record(duration_ms as f64);

        self.stages.push(StageResult {
            stage,
            success,
            output,
            error,
            duration_ms,
        });
    }

    fn push_command(&mut self, stage: Stage, result: &CommandResult, started: Instant) {
        self.push(
            stage,
            result.success,
            result.output.clone(),
            result.error.clone(),
            started,
        );
    }

    fn fail(
        mut self,
        stage: Stage,
        failure: FailureKind,
        message: String,
        output: String,
        exit_code: Option<i64>,
        started: Instant,
    ) -> ExecutionOutcome {
        self.push(stage, false, output.clone(), Some(message.clone()), started);
        self.finish(false, output, Some(message), exit_code, Some(failure))
    }

    fn finish(
        self,
        success: bool,
        output: String,
        error: Option<String>,
        exit_code: Option<i64>,
        failure: Option<FailureKind>,
    ) -> ExecutionOutcome {
        let outcome = ExecutionOutcome {
            success,
            output,
            error,
            exit_code,
            language: self.language,
            failure,
            stages: self.stages,
            total_duration_ms: elapsed_ms(self.started),
        };

        metrics::counter!(
            "sandbox_executions_total",
            "language" => outcome.language.clone().unwrap_or_else(|| "unknown".to_string()),
            "outcome" => if outcome.success { "success" } else { "failure" }
        )
        .increment(1);

        outcome
    }

    /// Finish with the result of the last command run.
    fn finish_command(self, result: CommandResult, on_exit: FailureKind) -> ExecutionOutcome {
        let failure = (!result.success).then(|| FailureKind::from_command(&result, on_exit));
        self.finish(result.success, result.output, result.error, result.exit_code, failure)
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

// =============================================================================
// Bootstrap Rules
// =============================================================================

/// A dependency manifest whose install output should exist before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapRule {
    pub manifest: &'static str,
    /// Directory prefix that exists once dependencies are installed.
    pub installed_dir: &'static str,
    pub install: &'static [&'static str],
    pub runtime: &'static str,
}

pub const BOOTSTRAP_RULES: &[BootstrapRule] = &[
    BootstrapRule {
        manifest: "package.json",
        installed_dir: "node_modules/",
        install: &["npm", "install"],
        runtime: "node",
    },
    BootstrapRule {
        manifest: "composer.json",
        installed_dir: "vendor/",
        install: &["composer", "install"],
        runtime: "php",
    },
    BootstrapRule {
        manifest: "Gemfile",
        installed_dir: "vendor/bundle/",
        install: &["bundle", "install", "--path", "vendor/bundle"],
        runtime: "ruby",
    },
];

/// Rules whose manifest is present at the workspace root but whose install
/// output is not.
pub fn pending_bootstraps(workspace_files: &[String]) -> Vec<&'static BootstrapRule> {
    let files: Vec<&str> = workspace_files
        .iter()
        .map(|f| f.trim_start_matches("./"))
        .collect();

    BOOTSTRAP_RULES
        .iter()
        .filter(|rule| files.contains(&rule.manifest))
        .filter(|rule| {
            let dir = rule.installed_dir.trim_end_matches('/');
            !files
                .iter()
                .any(|f| *f == dir || f.starts_with(rule.installed_dir))
        })
        .collect()
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Orchestrates file execution against the capability registry and the
/// lifecycle manager.
#[derive(Clone)]
pub struct Dispatcher {
    lifecycle: LifecycleManager,
    registry: Arc<CapabilityRegistry>,
    files: Arc<dyn FileStore>,
}

impl Dispatcher {
    pub fn new(
        lifecycle: LifecycleManager,
        registry: Arc<CapabilityRegistry>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            files,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Detect, validate, and run one file.
    pub async fn execute_file(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let mut outcome = OutcomeBuilder::new();
        let detect_started = Instant::now();
        let workspace_id = request.workspace_id.as_str();

        let (relative, source_path) = match normalize_workspace_path(&request.file_path).and_then(|rel| {
            let source = container_path(&self.lifecycle.config().mount_path, &request.file_path)?;
            Ok((rel.to_string_lossy().into_owned(), source))
        }) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(workspace_id, path = %request.file_path, error = %e, "Rejected file path");
                let kind = match &e {
                    Error::SecurityViolation(_) | Error::InvalidRequest(_) => FailureKind::InvalidRequest,
                    _ => FailureKind::InfrastructureFailure,
                };
                return outcome.fail(Stage::Detection, kind, e.to_string(), String::new(), None, detect_started);
            }
        };

        let content = match self.files.get_file_by_path(workspace_id, &relative).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(workspace_id, path = %relative, error = %e, "File store read failed; detecting without content");
                None
            }
        };
        let workspace_files = match self.files.get_files_by_workspace(workspace_id).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(workspace_id, error = %e, "File store listing failed; detecting without manifests");
                Vec::new()
            }
        };

        let ctx = DetectionContext {
            file_path: &relative,
            content: content.as_deref(),
            workspace_files: &workspace_files,
            language_hint: request.language_hint.as_deref(),
        };
        let Some(cap) = self.registry.detect(&ctx) else {
            let message = format!(
                "Unsupported language for '{}'. Supported languages: {}",
                request.file_path,
                self.registry.supported_languages().join(", ")
            );
            tracing::info!(workspace_id, path = %relative, "No capability matched");
            return outcome.fail(
                Stage::Detection,
                FailureKind::UnsupportedLanguage,
                message,
                String::new(),
                None,
                detect_started,
            );
        };

        outcome.language = Some(cap.id.to_string());
        tracing::info!(
            workspace_id,
            path = %relative,
            language = cap.id,
            mode = ?cap.mode,
            "Dispatching file execution"
        );

        let first_stage = match cap.mode {
            ExecutionMode::CompileRun => Stage::Compilation,
            _ => Stage::Execution,
        };

        let tools_started = Instant::now();
        match self.missing_tools(request, cap).await {
            Ok(missing) if missing.is_empty() => {}
            Ok(missing) => {
                let message = format!(
                    "Missing required tools for {}: {}",
                    cap.name,
                    missing.join(", ")
                );
                return outcome.fail(first_stage, FailureKind::MissingTool, message, String::new(), None, tools_started);
            }
            Err(StageError::Timeout) => {
                return outcome.fail(
                    first_stage,
                    FailureKind::Timeout,
                    timeout_message(request),
                    String::new(),
                    None,
                    tools_started,
                )
            }
            Err(StageError::Infrastructure(message)) => {
                return outcome.fail(
                    first_stage,
                    FailureKind::InfrastructureFailure,
                    message,
                    String::new(),
                    None,
                    tools_started,
                )
            }
        }

        match cap.mode {
            ExecutionMode::Interpreter => {
                let argv = cap.interpreter_command(&source_path);
                self.run_final_stage(request, cap, argv, outcome, tools_started).await
            }
            ExecutionMode::Script => {
                let argv = cap.script_command(request.script.as_deref());
                self.run_final_stage(request, cap, argv, outcome, tools_started).await
            }
            ExecutionMode::CompileRun => {
                let build_dir = self.registry.build_dir_for(workspace_id, cap.id);
                let build = BuildContext {
                    output_path: self.registry.output_path_for(workspace_id, cap.id, &relative),
                    entry_point: self.registry.resolve_entry_point(
                        cap,
                        &relative,
                        content.as_deref().unwrap_or_default(),
                    ),
                    source_path,
                    build_dir,
                };
                self.compile_and_run(request, cap, build, outcome, tools_started).await
            }
        }
    }

    async fn compile_and_run(
        &self,
        request: &ExecutionRequest,
        cap: &Capability,
        build: BuildContext,
        mut outcome: OutcomeBuilder,
        started: Instant,
    ) -> ExecutionOutcome {
        let (Some(build_command), Some(run_command)) = (cap.build_command, cap.run_command) else {
            return outcome.fail(
                Stage::Compilation,
                FailureKind::InfrastructureFailure,
                format!("{} has no build or run command", cap.name),
                String::new(),
                None,
                started,
            );
        };

        let mkdir = vec!["mkdir".to_string(), "-p".to_string(), build.build_dir.clone()];
        let prepared = match self.run_command(request, cap, mkdir).await {
            Ok(result) => result,
            Err(e) => return self.stage_error(outcome, Stage::Compilation, request, e, started),
        };
        if !prepared.success {
            let message = format!(
                "Could not prepare build directory {}: {}",
                build.build_dir,
                prepared.error.clone().unwrap_or_default()
            );
            return outcome.fail(
                Stage::Compilation,
                FailureKind::InfrastructureFailure,
                message,
                prepared.output,
                prepared.exit_code,
                started,
            );
        }

        let compiled = match self.run_command(request, cap, build_command(&build)).await {
            Ok(result) => result,
            Err(e) => return self.stage_error(outcome, Stage::Compilation, request, e, started),
        };
        outcome.push_command(Stage::Compilation, &compiled, started);
        if !compiled.success {
            tracing::info!(
                workspace_id = %request.workspace_id,
                language = cap.id,
                exit_code = ?compiled.exit_code,
                "Compilation failed"
            );
            return outcome.finish_command(compiled, FailureKind::CompilationFailure);
        }

        let argv = run_command(&build);
        self.run_final_stage(request, cap, argv, outcome, Instant::now()).await
    }

    async fn run_final_stage(
        &self,
        request: &ExecutionRequest,
        cap: &Capability,
        argv: Vec<String>,
        mut outcome: OutcomeBuilder,
        started: Instant,
    ) -> ExecutionOutcome {
        match self.run_command(request, cap, argv).await {
            Ok(result) => {
                outcome.push_command(Stage::Execution, &result, started);
                outcome.finish_command(result, FailureKind::RuntimeFailure)
            }
            Err(e) => self.stage_error(outcome, Stage::Execution, request, e, started),
        }
    }

    fn stage_error(
        &self,
        outcome: OutcomeBuilder,
        stage: Stage,
        request: &ExecutionRequest,
        error: StageError,
        started: Instant,
    ) -> ExecutionOutcome {
        match error {
            StageError::Timeout => {
                tracing::warn!(
                    workspace_id = %request.workspace_id,
                    stage = stage.as_str(),
                    "Stage timed out; the process keeps running in the container"
                );
                outcome.fail(stage, FailureKind::Timeout, timeout_message(request), String::new(), None, started)
            }
            StageError::Infrastructure(message) => outcome.fail(
                stage,
                FailureKind::InfrastructureFailure,
                message,
                String::new(),
                None,
                started,
            ),
        }
    }

    /// Probe for each required tool; returns the ones that are absent.
    async fn missing_tools(
        &self,
        request: &ExecutionRequest,
        cap: &Capability,
    ) -> std::result::Result<Vec<&'static str>, StageError> {
        let mut missing = Vec::new();
        for tool in cap.required_tools {
            let probe = vec!["which".to_string(), tool.to_string()];
            let result = self.run_command(request, cap, probe).await?;
            if result.is_infrastructure_failure() {
                return Err(StageError::Infrastructure(result.error.unwrap_or_default()));
            }
            if !result.success {
                missing.push(*tool);
            }
        }
        if !missing.is_empty() {
            tracing::info!(workspace_id = %request.workspace_id, language = cap.id, missing = ?missing, "Required tools missing");
        }
        Ok(missing)
    }

    async fn run_command(
        &self,
        request: &ExecutionRequest,
        cap: &Capability,
        argv: Vec<String>,
    ) -> std::result::Result<CommandResult, StageError> {
        let exec = self
            .lifecycle
            .exec_in_with_env(&request.workspace_id, &argv, cap.runtime, &request.env);
        with_timeout(request.timeout, exec).await
    }

    /// Install missing dependencies for root-level manifests, then run the
    /// file. Install failures are logged and never block execution.
    pub async fn execute_with_bootstrap(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        match self.files.get_files_by_workspace(&request.workspace_id).await {
            Ok(files) => {
                for rule in pending_bootstraps(&files) {
                    self.bootstrap(request, rule).await;
                }
            }
            Err(e) => {
                tracing::warn!(workspace_id = %request.workspace_id, error = %e, "Skipping bootstrap; file listing failed")
            }
        }

        self.execute_file(request).await
    }

    async fn bootstrap(&self, request: &ExecutionRequest, rule: &BootstrapRule) {
        let argv: Vec<String> = rule.install.iter().map(|s| s.to_string()).collect();
        tracing::info!(
            workspace_id = %request.workspace_id,
            manifest = rule.manifest,
            command = %argv.join(" "),
            "Bootstrapping dependencies"
        );

        let exec = self
            .lifecycle
            .exec_in_with_env(&request.workspace_id, &argv, rule.runtime, &request.env);
        match with_timeout(request.timeout, exec).await {
            Ok(result) if result.success => {
                tracing::info!(workspace_id = %request.workspace_id, manifest = rule.manifest, "Dependencies installed")
            }
            Ok(result) => tracing::warn!(
                workspace_id = %request.workspace_id,
                manifest = rule.manifest,
                exit_code = ?result.exit_code,
                error = ?result.error,
                "Dependency install failed; continuing"
            ),
            Err(_) => tracing::warn!(
                workspace_id = %request.workspace_id,
                manifest = rule.manifest,
                "Dependency install timed out; continuing"
            ),
        }
    }
}

#[derive(Debug)]
enum StageError {
    Timeout,
    Infrastructure(String),
}

async fn with_timeout<F>(timeout: Option<Duration>, fut: F) -> std::result::Result<CommandResult, StageError>
where
    F: Future<Output = CommandResult>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StageError::Timeout),
        None => Ok(fut.await),
    }
}

fn timeout_message(request: &ExecutionRequest) -> String {
    format!(
        "Execution exceeded the {}ms time limit",
        request.timeout.unwrap_or_default().as_millis()
    )
}

// =============================================================================
// Tests
// =============================================================================
