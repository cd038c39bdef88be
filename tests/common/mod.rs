//! Scripted container engine shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use local_sandbox::{
    BuildDefinition, ContainerEngine, ContainerSpec, EngineError, EngineResult, ExecOutput,
    ExecRequest, ImageRef, SandboxEvent, WorkspaceSnapshot,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

/// Canned answer for one command.
#[derive(Clone)]
pub enum Scripted {
    Ok { stdout: String, stderr: String },
    Fail(String),
}

/// What the engine saw for one exec call.
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub image: String,
    pub command: String,
    pub snapshot_digest: Option<String>,
    pub files: Vec<String>,
}

#[derive(Default)]
pub struct FakeEngine {
    failing_pulls: Mutex<HashSet<String>>,
    fail_every_pull: bool,
    fail_builds: bool,
    pull_delay: Duration,
    exec_delay: Duration,
    local_images: Mutex<HashSet<String>>,
    registry_user: Option<String>,
    script: Mutex<HashMap<String, Scripted>>,
    pub pulls: Mutex<Vec<String>>,
    pub builds: Mutex<Vec<String>>,
    pub pushes: Mutex<Vec<String>>,
    pub execs: Mutex<Vec<ExecCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_pull(self, image: &str) -> Self {
        self.failing_pulls.lock().unwrap().insert(image.to_string());
        self
    }

    pub fn failing_every_pull(mut self) -> Self {
        self.fail_every_pull = true;
        self
    }

    pub fn failing_builds(mut self) -> Self {
        self.fail_builds = true;
        self
    }

    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    pub fn with_local_image(self, tag: &str) -> Self {
        self.local_images.lock().unwrap().insert(tag.to_string());
        self
    }

    pub fn logged_in_as(mut self, user: &str) -> Self {
        self.registry_user = Some(user.to_string());
        self
    }

    pub fn builds(&self) -> Vec<String> {
        self.builds.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn script(self, command: &str, outcome: Scripted) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(command.to_string(), outcome);
        self
    }

    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.execs.lock().unwrap().clone()
    }

    pub fn max_concurrent_execs(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        Ok(self.local_images.lock().unwrap().contains(image))
    }

    async fn pull(&self, image: &str) -> EngineResult<ImageRef> {
        self.pulls.lock().unwrap().push(image.to_string());
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }
        if self.fail_every_pull || self.failing_pulls.lock().unwrap().contains(image) {
            return Err(EngineError::Pull {
                image: image.to_string(),
                message: "manifest unknown".to_string(),
            });
        }
        Ok(ImageRef::new(image))
    }

    async fn build(&self, definition: &BuildDefinition, tag: &str) -> EngineResult<ImageRef> {
        self.builds.lock().unwrap().push(tag.to_string());
        if self.fail_builds {
            return Err(EngineError::Build {
                tag: tag.to_string(),
                dockerfile: definition.dockerfile.display().to_string(),
                message: "step 3/7 failed".to_string(),
            });
        }
        Ok(ImageRef::new(tag))
    }

    async fn push(&self, _image: &ImageRef, target: &str) -> EngineResult<()> {
        self.pushes.lock().unwrap().push(target.to_string());
        Ok(())
    }

    async fn registry_user(&self) -> EngineResult<Option<String>> {
        Ok(self.registry_user.clone())
    }

    async fn exec(
        &self,
        spec: ContainerSpec<'_>,
        request: &ExecRequest,
    ) -> EngineResult<ExecOutput> {
        self.execs.lock().unwrap().push(ExecCall {
            image: spec.image.to_string(),
            command: request.command.clone(),
            snapshot_digest: spec.snapshot.map(|s| s.digest().to_string()),
            files: request.files.iter().map(|f| f.path.clone()).collect(),
        });

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.script.lock().unwrap().get(&request.command).cloned();
        match scripted {
            Some(Scripted::Fail(message)) => Err(EngineError::Exec(message)),
            Some(Scripted::Ok { stdout, stderr }) => Ok(ExecOutput {
                stdout,
                stderr,
                workspace: request
                    .capture_workspace
                    .then(|| WorkspaceSnapshot::from_archive(request.command.as_bytes().to_vec())),
            }),
            None => Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                workspace: request
                    .capture_workspace
                    .then(|| WorkspaceSnapshot::from_archive(request.command.as_bytes().to_vec())),
            }),
        }
    }
}

pub fn ok(stdout: &str, stderr: &str) -> Scripted {
    Scripted::Ok {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

pub fn drain(rx: &mut broadcast::Receiver<SandboxEvent>) -> Vec<SandboxEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
