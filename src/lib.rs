//! Local Sandbox - containerized command execution for coding agents
//!
//! Gives each agent session a long-lived, isolated execution environment on
//! the local container engine. A sandbox resolves its base image once, then
//! runs every command in a short-lived working container assembled from the
//! base plus the latest capture of its working directory, so file changes
//! carry forward from one command to the next.
//!
//! # Features
//!
//! - **Image Resolution**: registry images, local builds, and a generic fallback
//! - **Workspace Snapshots**: the working directory survives between commands
//! - **Event Streaming**: start/update/error/end events over a broadcast channel
//! - **Pluggable Engines**: the `docker` CLI, or plain host processes
//!
//! # Quick Start
//!
//! ```no_run
//! use local_sandbox::{CreateOptions, LocalConfig, LocalSandboxProvider, RunOptions, SandboxProvider};
//!
//! # async fn demo() -> local_sandbox::SandboxResult<()> {
//! let provider = LocalSandboxProvider::docker(LocalConfig::discover());
//! let sandbox = provider
//!     .create(CreateOptions::new().agent("claude").env("FOO", "bar"))
//!     .await?;
//!
//! let result = sandbox.commands().run("echo $FOO", RunOptions::new()).await?;
//! assert_eq!(result.exit_code, 0);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod base;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod image;
pub mod prebuild;
pub mod provider;
pub mod registry;
pub mod sandbox;
pub mod shell;
pub mod snapshot;

// Re-export main types
pub use agent::AgentType;
pub use base::{BaseContainer, BaseContainerCache};
pub use config::{LocalConfig, CONFIG_FILE_NAME};
pub use engine::{
    BuildDefinition, ContainerEngine, ContainerSpec, DockerEngine, EngineError, EngineResult,
    ExecOutput, ExecRequest, ImageRef, ProcessEngine,
};
pub use error::{SandboxError, SandboxResult};
pub use events::{next_event, EventBus, EventKind, OutputCallback, ReplayPacing, SandboxEvent};
pub use executor::{extract_exit_code, CommandResult, RunOptions};
pub use image::{ImageResolution, ImageResolver, ImageSource, ImageStrategy, GENERIC_IMAGE};
pub use prebuild::{prebuild_agent_images, PrebuildOutcome, PrebuildReport, PrebuildSource};
pub use provider::{CreateOptions, LocalSandboxProvider, SandboxProvider, DEFAULT_WORKDIR};
pub use registry::{setup_registry, upload_agent_images, UploadOutcome, UploadReport};
pub use sandbox::{Commands, LocalSandbox, SandboxStatus};
pub use snapshot::{FileWrite, WorkspaceSnapshot, WorkspaceStore};
