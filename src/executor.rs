use crate::base::BaseContainer;
use crate::engine::{ContainerEngine, ContainerSpec, ExecRequest};
use crate::events::{EventBus, OutputCallback, ReplayPacing, SandboxEvent};
use crate::snapshot::WorkspaceSnapshot;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, warn};

static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"exit code:?\s*(-?\d+)").expect("valid regex"));

/// Exit code embedded in an engine failure message, or 1.
pub fn extract_exit_code(message: &str) -> i32 {
    EXIT_CODE_RE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|code| code.as_str().parse().ok())
        .filter(|code| *code != 0)
        .unwrap_or(1)
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options accepted by [`CommandExecutor::run`].
#[derive(Default)]
pub struct RunOptions {
    /// Accepted for interface compatibility; not enforced.
    pub timeout_ms: Option<u64>,
    pub background: bool,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn on_stdout(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stdout = Some(Box::new(callback));
        self
    }

    pub fn on_stderr(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stderr = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("timeout_ms", &self.timeout_ms)
            .field("background", &self.background)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// Runs commands against the base container layered with the current
/// workspace snapshot.
///
/// The caller passes the snapshot slot it holds under the instance's
/// workspace lock and keeps holding it until `run` returns, so runs on one
/// instance are serialized and their event sequences never interleave.
pub struct CommandExecutor<'a> {
    pub engine: &'a dyn ContainerEngine,
    pub base: &'a BaseContainer,
    pub workdir: &'a str,
    pub events: &'a EventBus,
    pub pacing: ReplayPacing,
}

impl CommandExecutor<'_> {
    fn spec<'s>(&'s self, snapshot: Option<&'s WorkspaceSnapshot>) -> ContainerSpec<'s> {
        ContainerSpec {
            image: &self.base.image,
            envs: &self.base.envs,
            workdir: self.workdir,
            snapshot,
        }
    }

    pub async fn run(
        &self,
        workspace: &mut Option<WorkspaceSnapshot>,
        command: &str,
        mut options: RunOptions,
    ) -> CommandResult {
        if let Some(timeout_ms) = options.timeout_ms {
            debug!("Timeout of {}ms requested for {:?}; not enforced", timeout_ms, command);
        }
        self.events.publish(SandboxEvent::start(command));

        let request = ExecRequest::new(command).capture();
        let outcome = self.engine.exec(self.spec(workspace.as_ref()), &request).await;

        let result = if options.background {
            // The engine cannot detach: the command has already finished here,
            // whatever its status, and is reported as started.
            match outcome {
                Ok(output) => {
                    if let Some(snapshot) = output.workspace {
                        *workspace = Some(snapshot);
                    }
                }
                Err(e) => warn!("Background command {:?} failed: {}", command, e),
            }
            CommandResult {
                exit_code: 0,
                stdout: format!("Background process started: {}", command),
                stderr: String::new(),
            }
        } else {
            match outcome {
                Ok(output) => {
                    if let Some(snapshot) = output.workspace {
                        *workspace = Some(snapshot);
                    }
                    self.events
                        .replay(
                            &output.stdout,
                            &output.stderr,
                            self.pacing,
                            options.on_stdout.as_mut(),
                            options.on_stderr.as_mut(),
                        )
                        .await;
                    CommandResult {
                        exit_code: 0,
                        stdout: output.stdout,
                        stderr: output.stderr,
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    let exit_code = extract_exit_code(&message);
                    debug!("Command {:?} failed with exit code {}", command, exit_code);
                    self.events.publish(SandboxEvent::error(message.clone()));
                    CommandResult {
                        exit_code,
                        stdout: String::new(),
                        stderr: message,
                    }
                }
            }
        };

        self.events
            .publish(SandboxEvent::end(command, result.exit_code));
        result
    }
}
