//! Sandbox execution engine for Devbox.
//!
//! Every workspace gets one resource-limited container, created on demand
//! and reclaimed once idle. Source files are detected, built, and run inside
//! it through a staged pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  Sandbox facade (ContainerSandbox or   │
//! │  SimulatedSandbox, chosen at startup)  │
//! │    ↓ execute_file                      │
//! ├────────────────────────────────────────┤
//! │  Dispatcher                            │
//! │    detection → tools → compile → run   │
//! │    ↓ uses              ↓ runs argv     │
//! │  CapabilityRegistry   LifecycleManager │
//! ├────────────────────────────────────────┤
//! │  ContainerEngine (DockerEngine)        │
//! │    ↓ Docker API via bollard            │
//! ├────────────────────────────────────────┤
//! │  devbox-ws-<workspace> container       │
//! │    /workspace  (bind-mounted)          │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use devbox_sandbox::{select_sandbox, Sandbox};
//!
//! let sandbox = select_sandbox(&config.sandbox, file_store).await?;
//! sandbox.initialize().await?;
//!
//! let outcome = sandbox.execute_file("src/main.go", "ws-42", None).await;
//! let listing = sandbox
//!     .execute_command_argv(&["ls".into(), "-la".into()], "ws-42")
//!     .await;
//! ```

pub mod capability;
pub mod dispatcher;
pub mod engine;
pub mod facade;
pub mod lifecycle;
pub mod limits;

pub use capability::{Capability, CapabilityRegistry, DetectionContext, ExecutionMode};
pub use dispatcher::{
    Dispatcher, ExecutionOutcome, ExecutionRequest, FailureKind, Stage, StageResult,
};
pub use engine::{ContainerEngine, ContainerStatus, DockerEngine, ExecOutput, MockEngine};
pub use facade::{
    choose_backend, select_sandbox, ContainerSandbox, OutputSink, PackageManager, Sandbox,
    SimulatedSandbox,
};
pub use lifecycle::{CommandResult, ContainerHandle, ContainerRecord, LifecycleManager, SandboxRequest};
