use crate::agent::AgentType;
use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File looked up in the current directory by [`LocalConfig::discover`].
pub const CONFIG_FILE_NAME: &str = ".vibekit-config.json";

/// Configuration for the local provider.
///
/// Always passed explicitly; nothing reads the working directory behind the
/// caller's back. Unknown keys in the file are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalConfig {
    /// Skip building from local definitions; registry and generic images only.
    pub prefer_registry_images: bool,
    /// Publisher account used for default registry images and pushes.
    pub docker_hub_user: Option<String>,
    /// Push freshly built images to the publisher account.
    pub push_images: bool,
    /// Registry host prefixed to default images (e.g. `ghcr.io`).
    pub private_registry: Option<String>,
    /// Accepted for compatibility; engine installation is not performed.
    pub auto_install: bool,
    /// Per-agent image overrides, keyed by agent name.
    pub registry_images: HashMap<String, String>,
    /// Directory holding `assets/dockerfiles`. Defaults to the current directory.
    pub build_context: Option<PathBuf>,
    pub last_image_build: Option<chrono::DateTime<chrono::Utc>>,
}

impl LocalConfig {
    /// Load configuration from `path`.
    ///
    /// A missing or malformed file yields the default configuration.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                debug!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Load configuration from `path`, reporting why it could not be read.
    pub fn try_load(path: &Path) -> SandboxResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::ConfigurationRead(format!("{}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| SandboxError::ConfigurationRead(format!("{}: {}", path.display(), e)))
    }

    /// Load `.vibekit-config.json` from the current directory.
    pub fn discover() -> Self {
        match std::env::current_dir() {
            Ok(dir) => Self::load(&dir.join(CONFIG_FILE_NAME)),
            Err(_) => Self::default(),
        }
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> SandboxResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// User-configured image for `agent`, if any.
    pub fn registry_image_for(&self, agent: &AgentType) -> Option<&str> {
        self.registry_images
            .get(agent.as_str())
            .map(String::as_str)
            .filter(|image| !image.trim().is_empty())
    }

    pub fn build_context(&self) -> PathBuf {
        self.build_context
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
