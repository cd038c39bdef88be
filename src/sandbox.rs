use crate::agent::AgentType;
use crate::base::{BaseContainer, BaseContainerCache};
use crate::engine::{ContainerEngine, ContainerSpec, ExecRequest};
use crate::error::{SandboxError, SandboxResult};
use crate::events::{EventBus, ReplayPacing, SandboxEvent};
use crate::executor::{CommandExecutor, CommandResult, RunOptions};
use crate::image::{ImageResolver, ImageSource};
use crate::shell;
use crate::snapshot::{resolve_path, FileWrite, WorkspaceSnapshot, WorkspaceStore};
use tokio::sync::MutexGuard;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// One long-lived sandbox backed by short-lived working containers.
///
/// Nothing is started on creation. The base container is resolved on the
/// first command or file access, and every command runs in a fresh working
/// container built from the base plus the latest workspace snapshot.
pub struct LocalSandbox {
    id: String,
    agent: Option<AgentType>,
    envs: BTreeMap<String, String>,
    working_dir: String,
    engine: Arc<dyn ContainerEngine>,
    resolver: ImageResolver,
    base: BaseContainerCache,
    workspace: WorkspaceStore,
    events: EventBus,
    pacing: ReplayPacing,
    running: AtomicBool,
}

/// `sandbox.commands().run(...)` surface.
pub struct Commands<'a> {
    sandbox: &'a LocalSandbox,
}

impl Commands<'_> {
    pub async fn run(&self, command: &str, options: RunOptions) -> SandboxResult<CommandResult> {
        self.sandbox.run(command, options).await
    }
}

impl LocalSandbox {
    pub(crate) fn new(
        id: String,
        agent: Option<AgentType>,
        envs: BTreeMap<String, String>,
        working_dir: String,
        engine: Arc<dyn ContainerEngine>,
        resolver: ImageResolver,
        pacing: ReplayPacing,
    ) -> Self {
        Self {
            id,
            agent,
            envs,
            working_dir,
            engine,
            resolver,
            base: BaseContainerCache::new(),
            workspace: WorkspaceStore::new(),
            events: EventBus::default(),
            pacing,
            running: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_type(&self) -> Option<&AgentType> {
        self.agent.as_ref()
    }

    pub fn envs(&self) -> &BTreeMap<String, String> {
        &self.envs
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Commands<'_> {
        Commands { sandbox: self }
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    /// Latest workspace capture, absent before the first command.
    pub async fn snapshot(&self) -> Option<WorkspaceSnapshot> {
        self.workspace.current().await
    }

    fn ensure_running(&self) -> SandboxResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SandboxError::Killed(self.id.clone()))
        }
    }

    async fn ensure_base(&self) -> SandboxResult<Arc<BaseContainer>> {
        self.ensure_running()?;
        let engine = self.engine.as_ref();
        let base = self
            .base
            .ensure_ready(|| async move {
                let resolution = self.resolver.resolve(engine, self.agent.as_ref()).await?;
                Ok(BaseContainer {
                    image: resolution.image,
                    source: resolution.source,
                    envs: self.envs.clone(),
                })
            })
            .await?;
        if let Err(e) = self.ensure_running() {
            // Killed while resolving: the fresh base must not outlive the kill.
            self.base.release();
            return Err(e);
        }
        Ok(base)
    }

    /// Enter the instance's critical section. A caller queued behind a
    /// `kill()` is turned away here, before it reaches the engine.
    async fn lock_workspace(&self) -> SandboxResult<MutexGuard<'_, Option<WorkspaceSnapshot>>> {
        let workspace = self.workspace.lock().await;
        self.ensure_running()?;
        Ok(workspace)
    }

    fn relative_to_workdir<'p>(&self, path: &'p str) -> Option<&'p str> {
        path.strip_prefix(self.working_dir.as_str())?
            .strip_prefix('/')
            .filter(|rest| !rest.is_empty())
    }

    /// Run a shell command. Execution failures come back as a non-zero
    /// exit code; only initialization failures and use after kill are errors.
    pub async fn run(&self, command: &str, options: RunOptions) -> SandboxResult<CommandResult> {
        let base = self.ensure_base().await?;
        let mut workspace = self.lock_workspace().await?;
        let executor = CommandExecutor {
            engine: self.engine.as_ref(),
            base: &base,
            workdir: &self.working_dir,
            events: &self.events,
            pacing: self.pacing,
        };
        let result = executor.run(&mut workspace, command, options).await;
        debug!("{} ran {:?}: exit code {}", self.id, command, result.exit_code);
        Ok(result)
    }

    /// Read a file from the current workspace. Relative paths resolve
    /// against the working directory.
    pub async fn read_file(&self, path: &str) -> SandboxResult<String> {
        let base = self.ensure_base().await?;
        let target = resolve_path(&self.working_dir, path)?;
        let workspace = self.lock_workspace().await?;

        let spec = ContainerSpec {
            image: &base.image,
            envs: &base.envs,
            workdir: &self.working_dir,
            snapshot: workspace.as_ref(),
        };
        // Inside the working directory the path is given relative to it, so
        // engines that relocate the container root read the right file.
        let arg = self.relative_to_workdir(&target).unwrap_or(&target);
        let request = ExecRequest::new(format!("cat -- {}", shell::quote(arg)));
        let output = self
            .engine
            .exec(spec, &request)
            .await
            .map_err(|e| SandboxError::Execution(e.to_string()))?;
        Ok(output.stdout)
    }

    /// Write a file and capture the resulting workspace.
    ///
    /// Only the working directory is carried forward; files written
    /// elsewhere do not survive into the next command.
    pub async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        let base = self.ensure_base().await?;
        let target = resolve_path(&self.working_dir, path)?;
        if self.relative_to_workdir(&target).is_none() {
            warn!(
                "{} is outside {}; the write will not persist",
                target, self.working_dir
            );
        }

        let mut workspace = self.lock_workspace().await?;
        let spec = ContainerSpec {
            image: &base.image,
            envs: &base.envs,
            workdir: &self.working_dir,
            snapshot: workspace.as_ref(),
        };
        let request = ExecRequest::new("true").capture().with_file(FileWrite {
            path: target,
            content: content.as_bytes().to_vec(),
        });
        let output = self
            .engine
            .exec(spec, &request)
            .await
            .map_err(|e| SandboxError::Execution(e.to_string()))?;

        if let Some(snapshot) = output.workspace {
            *workspace = Some(snapshot);
        }
        Ok(())
    }

    /// Stop the sandbox. Only in-memory references are dropped; no process
    /// outlives a single call, so there is nothing to signal.
    pub async fn kill(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Killed sandbox {}", self.id);
        }
        self.base.release();
        self.workspace.clear().await;
    }

    /// No-op: working containers only exist for the duration of a call.
    pub async fn pause(&self) {}

    pub async fn get_host(&self, _port: u16) -> String {
        "localhost".to_string()
    }

    /// Get sandbox status
    pub async fn status(&self) -> SandboxStatus {
        let base = self.base.get();
        let snapshot = self.workspace.current().await;
        SandboxStatus {
            id: self.id.clone(),
            agent_type: self.agent.clone(),
            working_dir: self.working_dir.clone(),
            running: self.is_running(),
            base_image: base.as_ref().map(|b| b.image.to_string()),
            image_source: base.as_ref().map(|b| b.source),
            snapshot_digest: snapshot.as_ref().map(|s| s.digest().to_string()),
            snapshot_bytes: snapshot.as_ref().map(WorkspaceSnapshot::size),
            snapshot_captured_at: snapshot.as_ref().map(WorkspaceSnapshot::captured_at),
        }
    }
}

impl std::fmt::Debug for LocalSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSandbox")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("working_dir", &self.working_dir)
            .field("engine", &self.engine.name())
            .field("base", &self.base)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Sandbox status information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub id: String,
    pub agent_type: Option<AgentType>,
    pub working_dir: String,
    pub running: bool,
    pub base_image: Option<String>,
    pub image_source: Option<ImageSource>,
    pub snapshot_digest: Option<String>,
    pub snapshot_bytes: Option<usize>,
    pub snapshot_captured_at: Option<DateTime<Utc>>,
}
