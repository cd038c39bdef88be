use super::{
    exit_failure, run_blocking, BuildDefinition, ContainerEngine, ContainerSpec, EngineError,
    EngineResult, ExecOutput, ExecRequest, ImageRef,
};
use crate::snapshot::{layer_archive, FileWrite, WorkspaceSnapshot};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::debug;

/// Runs commands on the host with `sh -c`, without isolation.
///
/// Each exec gets a fresh scratch directory standing in for the container
/// root: the layered archive is unpacked into it, the command runs inside
/// `<scratch>/<workdir>`, and the working directory is archived back out.
/// Images are accepted but never materialized. Commands that use absolute
/// paths see the host filesystem, not the scratch root.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    scratch_root: Option<PathBuf>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self { scratch_root: None }
    }

    /// Place scratch directories under `dir` instead of the system temp dir.
    pub fn with_scratch_root(dir: PathBuf) -> Self {
        Self {
            scratch_root: Some(dir),
        }
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn create_scratch(scratch_root: Option<&Path>) -> EngineResult<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("local-sandbox-");
    let dir = match scratch_root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}

/// Fresh scratch root with the layered workspace unpacked into it.
fn prepare_root(
    scratch_root: Option<&Path>,
    container_workdir: &str,
    snapshot: Option<&WorkspaceSnapshot>,
    files: &[FileWrite],
) -> EngineResult<(tempfile::TempDir, PathBuf)> {
    let scratch = create_scratch(scratch_root)?;
    let workdir = host_path(scratch.path(), container_workdir);
    std::fs::create_dir_all(&workdir)?;

    if let Some(archive) = layer_archive(snapshot, files).map_err(archive_error)? {
        WorkspaceSnapshot::from_archive(archive)
            .unpack_into(scratch.path())
            .map_err(archive_error)?;
    }
    Ok((scratch, workdir))
}

fn host_path(root: &Path, container_path: &str) -> PathBuf {
    root.join(container_path.trim_start_matches('/'))
}

fn archive_error(e: crate::error::SandboxError) -> EngineError {
    EngineError::Archive(e.to_string())
}

#[async_trait]
impl ContainerEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn image_exists(&self, _image: &str) -> EngineResult<bool> {
        Ok(true)
    }

    async fn pull(&self, image: &str) -> EngineResult<ImageRef> {
        Ok(ImageRef::new(image))
    }

    async fn build(&self, definition: &BuildDefinition, tag: &str) -> EngineResult<ImageRef> {
        if !definition.dockerfile.exists() {
            return Err(EngineError::Build {
                tag: tag.to_string(),
                dockerfile: definition.dockerfile.display().to_string(),
                message: "build definition not found".to_string(),
            });
        }
        Ok(ImageRef::new(tag))
    }

    async fn push(&self, image: &ImageRef, _target: &str) -> EngineResult<()> {
        Err(EngineError::Push {
            image: image.to_string(),
            message: "the process engine has no registry".to_string(),
        })
    }

    async fn exec(
        &self,
        spec: ContainerSpec<'_>,
        request: &ExecRequest,
    ) -> EngineResult<ExecOutput> {
        let scratch_root = self.scratch_root.clone();
        let container_workdir = spec.workdir.to_string();
        let snapshot = spec.snapshot.cloned();
        let files = request.files.clone();
        let (scratch, workdir) = run_blocking(move || {
            prepare_root(
                scratch_root.as_deref(),
                &container_workdir,
                snapshot.as_ref(),
                &files,
            )
        })
        .await?;

        debug!(
            "process exec in {} ({}): {}",
            spec.workdir,
            spec.image,
            request.command
        );
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .current_dir(&workdir)
            .envs(spec.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Exec(format!("failed to spawn sh: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let capture = request.capture_workspace && output.status.success();
        let container_workdir = spec.workdir.to_string();
        let workspace = run_blocking(move || {
            let workspace = if capture {
                Some(
                    WorkspaceSnapshot::capture_dir(&workdir, &container_workdir)
                        .map_err(archive_error)?,
                )
            } else {
                None
            };
            drop(scratch);
            Ok(workspace)
        })
        .await?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(exit_failure(&request.command, code, &stderr));
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            workspace,
        })
    }
}
