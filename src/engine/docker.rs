use super::{
    exit_failure, run_blocking, BuildDefinition, ContainerEngine, ContainerSpec, EngineError,
    EngineResult, ExecOutput, ExecRequest, ImageRef,
};
use crate::snapshot::{layer_archive, rebase_archive, WorkspaceSnapshot};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::io;
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Key of Docker Hub in credential helper listings.
const DOCKER_HUB_INDEX: &str = "https://index.docker.io/v1/";

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Username:\s*(\S+)").expect("valid regex"));

/// Entry point of every working container.
///
/// `$1` is the working directory, `$2` the command, `$3` set to `1` when a
/// workspace archive is streamed on stdin to be extracted into `/`.
const ENTRYPOINT_SCRIPT: &str = r#"mkdir -p "$1" && if [ "$3" = 1 ]; then tar -xf - -C /; fi && cd "$1" && exec sh -c "$2""#;

/// Engine backed by the `docker` CLI (or a compatible one such as `podman`).
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
    container_prefix: String,
}

impl DockerEngine {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            container_prefix: "local-sandbox".to_string(),
        }
    }

    /// Check that the CLI is installed and the daemon answers.
    pub async fn probe(&self) -> EngineResult<()> {
        let output = Command::new(&self.binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::Unavailable {
                engine: self.binary.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(EngineError::Unavailable {
                engine: self.binary.clone(),
                message: stderr_text(&output),
            });
        }
        Ok(())
    }

    fn container_name(&self) -> String {
        format!("{}-{}", self.container_prefix, Uuid::new_v4())
    }

    async fn docker(&self, args: &[&str]) -> std::io::Result<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    }

    fn create_args(
        &self,
        name: &str,
        spec: &ContainerSpec<'_>,
        command: &str,
        restore: bool,
    ) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        for (key, value) in spec.envs {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }
        args.extend([
            "--entrypoint".to_string(),
            "sh".to_string(),
            spec.image.to_string(),
            "-c".to_string(),
            ENTRYPOINT_SCRIPT.to_string(),
            "sh".to_string(),
            spec.workdir.to_string(),
            command.to_string(),
            if restore { "1" } else { "0" }.to_string(),
        ]);
        args
    }

    /// Start the created container attached, streaming `stdin` into it.
    ///
    /// stdin is fed from its own task while the output pipes drain. A
    /// container that exits before reading everything only costs a broken
    /// pipe; its exit code and stderr still come through `inspect`.
    async fn start(&self, name: &str, stdin: Option<Vec<u8>>) -> EngineResult<Output> {
        let mut child = Command::new(&self.binary)
            .args(["start", "-a", "-i", name])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Exec(format!("failed to start container: {}", e)))?;

        let feeder = child.stdin.take().map(|mut pipe| {
            tokio::spawn(async move {
                if let Some(bytes) = stdin {
                    pipe.write_all(&bytes).await?;
                }
                pipe.shutdown().await
            })
        });

        let output = child.wait_with_output().await?;

        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("container {} stopped reading its workspace early", name)
                }
                Ok(Err(e)) => warn!("failed to stream workspace into {}: {}", name, e),
                Err(e) => warn!("workspace feeder for {} failed: {}", name, e),
            }
        }
        Ok(output)
    }

    async fn exit_code(&self, name: &str) -> EngineResult<i32> {
        let output = self
            .docker(&["inspect", "--format", "{{.State.ExitCode}}", name])
            .await?;
        if !output.status.success() {
            return Err(EngineError::Exec(format!(
                "failed to inspect container {}: {}",
                name,
                stderr_text(&output)
            )));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|e| EngineError::Exec(format!("unreadable exit code for {}: {}", name, e)))
    }

    async fn copy_out(&self, name: &str, workdir: &str) -> EngineResult<WorkspaceSnapshot> {
        let source = format!("{}:{}", name, workdir);
        let output = self.docker(&["cp", &source, "-"]).await?;
        if !output.status.success() {
            return Err(EngineError::Archive(format!(
                "failed to copy {} out: {}",
                workdir,
                stderr_text(&output)
            )));
        }
        let workdir = workdir.to_string();
        let archive = run_blocking(move || {
            rebase_archive(output.stdout, &workdir).map_err(|e| EngineError::Archive(e.to_string()))
        })
        .await?;
        Ok(WorkspaceSnapshot::from_archive(archive))
    }

    async fn remove(&self, name: &str) {
        match self.docker(&["rm", "-f", name]).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!("failed to remove container {}: {}", name, stderr_text(&output)),
            Err(e) => warn!("failed to remove container {}: {}", name, e),
        }
    }

    async fn run_in(
        &self,
        name: &str,
        spec: &ContainerSpec<'_>,
        request: &ExecRequest,
    ) -> EngineResult<ExecOutput> {
        let snapshot = spec.snapshot.cloned();
        let files = request.files.clone();
        let stdin = run_blocking(move || {
            layer_archive(snapshot.as_ref(), &files).map_err(|e| EngineError::Archive(e.to_string()))
        })
        .await?;

        let args = self.create_args(name, spec, &request.command, stdin.is_some());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let created = self.docker(&args).await?;
        if !created.status.success() {
            return Err(EngineError::Exec(format!(
                "failed to create container from {}: {}",
                spec.image,
                stderr_text(&created)
            )));
        }

        let output = self.start(name, stdin).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let code = self.exit_code(name).await?;
        if code != 0 {
            return Err(exit_failure(&request.command, code, &stderr));
        }

        let workspace = if request.capture_workspace {
            Some(self.copy_out(name, spec.workdir).await?)
        } else {
            None
        };

        Ok(ExecOutput {
            stdout,
            stderr,
            workspace,
        })
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Logged-in user from `docker info` output.
fn parse_info_username(info: &str) -> Option<String> {
    USERNAME_RE
        .captures(info)
        .and_then(|caps| caps.get(1))
        .map(|user| user.as_str().to_string())
}

/// Docker Hub user from a credential helper's `list` output.
fn parse_credential_list(listing: &[u8]) -> Option<String> {
    let entries: HashMap<String, String> = serde_json::from_slice(listing).ok()?;
    entries
        .get(DOCKER_HUB_INDEX)
        .map(|user| user.trim().to_string())
        .filter(|user| !user.is_empty())
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        let output = self.docker(&["image", "inspect", image]).await?;
        Ok(output.status.success())
    }

    async fn pull(&self, image: &str) -> EngineResult<ImageRef> {
        if self.image_exists(image).await? {
            return Ok(ImageRef::new(image));
        }
        let output = self.docker(&["pull", image]).await?;
        if !output.status.success() {
            return Err(EngineError::Pull {
                image: image.to_string(),
                message: stderr_text(&output),
            });
        }
        Ok(ImageRef::new(image))
    }

    async fn build(&self, definition: &BuildDefinition, tag: &str) -> EngineResult<ImageRef> {
        let dockerfile = definition.dockerfile.to_string_lossy().into_owned();
        let context = definition.context.to_string_lossy().into_owned();
        let output = self
            .docker(&["build", "-t", tag, "-f", &dockerfile, &context])
            .await?;
        if !output.status.success() {
            return Err(EngineError::Build {
                tag: tag.to_string(),
                dockerfile,
                message: stderr_text(&output),
            });
        }
        Ok(ImageRef::new(tag))
    }

    async fn push(&self, image: &ImageRef, target: &str) -> EngineResult<()> {
        let push_error = |output: &Output| EngineError::Push {
            image: target.to_string(),
            message: stderr_text(output),
        };

        let tagged = self.docker(&["tag", image.as_str(), target]).await?;
        if !tagged.status.success() {
            return Err(push_error(&tagged));
        }
        let pushed = self.docker(&["push", target]).await?;
        if !pushed.status.success() {
            return Err(push_error(&pushed));
        }
        Ok(())
    }

    async fn registry_user(&self) -> EngineResult<Option<String>> {
        let info = self.docker(&["info"]).await?;
        if info.status.success() {
            if let Some(user) = parse_info_username(&String::from_utf8_lossy(&info.stdout)) {
                return Ok(Some(user));
            }
        }

        // Docker Desktop keeps the login in its credential helper instead.
        let listing = Command::new("docker-credential-desktop")
            .arg("list")
            .stdin(Stdio::null())
            .output()
            .await;
        match listing {
            Ok(output) if output.status.success() => Ok(parse_credential_list(&output.stdout)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!("no credential helper available: {}", e);
                Ok(None)
            }
        }
    }

    async fn exec(
        &self,
        spec: ContainerSpec<'_>,
        request: &ExecRequest,
    ) -> EngineResult<ExecOutput> {
        let name = self.container_name();
        let result = self.run_in(&name, &spec, request).await;
        self.remove(&name).await;
        result
    }
}
