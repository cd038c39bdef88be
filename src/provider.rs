use crate::agent::AgentType;
use crate::config::LocalConfig;
use crate::engine::{ContainerEngine, DockerEngine, ProcessEngine};
use crate::error::{SandboxError, SandboxResult};
use crate::events::ReplayPacing;
use crate::image::ImageResolver;
use crate::sandbox::LocalSandbox;
use crate::snapshot::resolve_path;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Working directory used when none is given.
pub const DEFAULT_WORKDIR: &str = "/vibe0";

/// Arguments of [`SandboxProvider::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub envs: HashMap<String, String>,
    pub agent_type: Option<AgentType>,
    pub working_dir: Option<String>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<AgentType>) -> Self {
        self.agent_type = Some(agent.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    type Instance: Send + Sync;

    async fn create(&self, options: CreateOptions) -> SandboxResult<Self::Instance>;

    /// Returns a fresh instance; prior state is not recovered.
    async fn resume(&self, id: &str) -> SandboxResult<Self::Instance>;

    async fn list(&self) -> SandboxResult<Vec<String>>;
}

/// Provider of sandboxes on the local container engine.
pub struct LocalSandboxProvider {
    config: RwLock<LocalConfig>,
    engine: Arc<dyn ContainerEngine>,
    pacing: ReplayPacing,
}

impl LocalSandboxProvider {
    pub fn new(config: LocalConfig, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            config: RwLock::new(config),
            engine,
            pacing: ReplayPacing::default(),
        }
    }

    /// Provider backed by the `docker` CLI.
    pub fn docker(config: LocalConfig) -> Self {
        Self::new(config, Arc::new(DockerEngine::new()))
    }

    /// Provider running commands directly on the host.
    pub fn process(config: LocalConfig) -> Self {
        Self::new(config, Arc::new(ProcessEngine::new()))
    }

    pub fn with_pacing(mut self, pacing: ReplayPacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn engine(&self) -> Arc<dyn ContainerEngine> {
        self.engine.clone()
    }

    pub fn config(&self) -> LocalConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read configuration from `path`. Instances created earlier keep
    /// the configuration they were created with.
    pub fn reload(&self, path: &Path) -> LocalConfig {
        let config = LocalConfig::load(path);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        info!("Reloaded configuration from {}", path.display());
        config
    }

    pub fn resolver(&self) -> ImageResolver {
        ImageResolver::new(self.config())
    }
}

impl std::fmt::Debug for LocalSandboxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSandboxProvider")
            .field("engine", &self.engine.name())
            .field("pacing", &self.pacing)
            .finish()
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    type Instance = LocalSandbox;

    async fn create(&self, options: CreateOptions) -> SandboxResult<LocalSandbox> {
        let working_dir = normalize_workdir(options.working_dir.as_deref())?;
        let id = next_sandbox_id(options.agent_type.as_ref());
        let envs: BTreeMap<String, String> = options.envs.into_iter().collect();

        info!(
            "Created sandbox {} (engine: {}, workdir: {})",
            id,
            self.engine.name(),
            working_dir
        );
        Ok(LocalSandbox::new(
            id,
            options.agent_type,
            envs,
            working_dir,
            self.engine.clone(),
            self.resolver(),
            self.pacing,
        ))
    }

    async fn resume(&self, id: &str) -> SandboxResult<LocalSandbox> {
        info!("Resuming {} as a fresh sandbox", id);
        self.create(CreateOptions::default()).await
    }

    async fn list(&self) -> SandboxResult<Vec<String>> {
        Ok(Vec::new())
    }
}

fn normalize_workdir(dir: Option<&str>) -> SandboxResult<String> {
    let dir = dir.map(str::trim).filter(|d| !d.is_empty());
    let Some(dir) = dir else {
        return Ok(DEFAULT_WORKDIR.to_string());
    };
    if !dir.starts_with('/') {
        return Err(SandboxError::InvalidArgument(format!(
            "Working directory must be absolute: {}",
            dir
        )));
    }
    let normalized = resolve_path("/", dir)?;
    if normalized == "/" {
        return Err(SandboxError::InvalidArgument(
            "The container root cannot be used as a working directory".to_string(),
        ));
    }
    Ok(normalized)
}

static LAST_ID_MILLIS: AtomicI64 = AtomicI64::new(0);

/// `local-<agent|default>-<base36 millis>`, strictly increasing per process.
fn next_sandbox_id(agent: Option<&AgentType>) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_ID_MILLIS.load(Ordering::SeqCst);
    let millis = loop {
        let candidate = now.max(last + 1);
        match LAST_ID_MILLIS.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => break candidate,
            Err(current) => last = current,
        }
    };
    format!(
        "local-{}-{}",
        agent.map(AgentType::as_str).unwrap_or("default"),
        to_base36(millis.unsigned_abs())
    )
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}
