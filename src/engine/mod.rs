//! Container engines the sandbox runs on.
//!
//! An engine is consumed as an opaque pull/build/exec unit. Every call is a
//! scoped acquisition: whatever the engine creates for a call (a container,
//! a scratch directory) is released before the call returns, so nothing is
//! held between two commands of the same instance.

pub mod docker;
pub mod process;

pub use docker::DockerEngine;
pub use process::ProcessEngine;

use crate::snapshot::{FileWrite, WorkspaceSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{engine} is not available: {message}")]
    Unavailable { engine: String, message: String },

    #[error("failed to pull {image}: {message}")]
    Pull { image: String, message: String },

    #[error("failed to build {tag} from {dockerfile}: {message}")]
    Build {
        tag: String,
        dockerfile: String,
        message: String,
    },

    #[error("failed to push {image}: {message}")]
    Push { image: String, message: String },

    /// Execution failures only carry free text; the exit code, when known,
    /// is embedded as `exit code: N`.
    #[error("{0}")]
    Exec(String),

    #[error("workspace archive error: {0}")]
    Archive(String),

    #[error("blocking task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Run filesystem and archive work off the async worker threads.
pub(crate) async fn run_blocking<T, F>(task: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
}

/// Failure text for a command that exited non-zero.
pub fn exit_failure(command: &str, exit_code: i32, stderr: &str) -> EngineError {
    let mut message = format!(
        "process \"sh -c {}\" did not complete successfully: exit code: {}",
        command, exit_code
    );
    if !stderr.trim().is_empty() {
        message.push_str("\n\nStderr:\n");
        message.push_str(stderr.trim_end());
    }
    EngineError::Exec(message)
}

/// Image reference usable as the base of a working container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local image build recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDefinition {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
}

/// Everything needed to assemble a working container.
#[derive(Debug, Clone, Copy)]
pub struct ContainerSpec<'a> {
    pub image: &'a ImageRef,
    pub envs: &'a BTreeMap<String, String>,
    pub workdir: &'a str,
    pub snapshot: Option<&'a WorkspaceSnapshot>,
}

/// One round-trip against a working container.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    /// Files layered on top of the snapshot before the command starts.
    pub files: Vec<FileWrite>,
    /// Copy the working directory back out after a successful command.
    pub capture_workspace: bool,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn capture(mut self) -> Self {
        self.capture_workspace = true;
        self
    }

    pub fn with_file(mut self, file: FileWrite) -> Self {
        self.files.push(file);
        self
    }
}

/// Output of a command that exited zero.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub workspace: Option<WorkspaceSnapshot>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether `image` is already present locally.
    async fn image_exists(&self, image: &str) -> EngineResult<bool>;

    async fn pull(&self, image: &str) -> EngineResult<ImageRef>;

    async fn build(&self, definition: &BuildDefinition, tag: &str) -> EngineResult<ImageRef>;

    /// Tag `image` as `target` and push it.
    async fn push(&self, image: &ImageRef, target: &str) -> EngineResult<()>;

    /// Account the engine is logged into on the default registry.
    async fn registry_user(&self) -> EngineResult<Option<String>> {
        Ok(None)
    }

    /// Run `request.command` with `sh -c` in a working container assembled
    /// from `spec`. A non-zero exit is an `EngineError::Exec`.
    async fn exec(&self, spec: ContainerSpec<'_>, request: &ExecRequest)
        -> EngineResult<ExecOutput>;
}
