//! Base image resolution.
//!
//! Every agent resolves through the same ordered chain: registry images
//! (user-configured first, then the published default), a local build from
//! the agent's build definition, and finally a generic image. A failing step
//! is logged and the next one is tried; only exhausting the chain is fatal.

use crate::agent::AgentType;
use crate::config::LocalConfig;
use crate::engine::{BuildDefinition, ContainerEngine, ImageRef};
use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Image used when nothing more specific can be obtained.
pub const GENERIC_IMAGE: &str = "ubuntu:24.04";

/// Publisher of the default agent images.
pub const DEFAULT_PUBLISHER: &str = "superagent-ai";

const DEFAULT_REGISTRY: &str = "docker.io";

/// Where a resolved image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Registry,
    Build,
    Fallback,
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageSource::Registry => "registry",
            ImageSource::Build => "build",
            ImageSource::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResolution {
    pub source: ImageSource,
    pub image: ImageRef,
}

/// One step of the resolution chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ImageStrategy {
    /// Pull the first reference that succeeds.
    Registry { candidates: Vec<String> },
    /// Build locally, optionally pushing the result.
    Build {
        definition: BuildDefinition,
        tag: String,
        push_target: Option<String>,
    },
    Fallback { image: String },
}

impl ImageStrategy {
    pub fn source(&self) -> ImageSource {
        match self {
            ImageStrategy::Registry { .. } => ImageSource::Registry,
            ImageStrategy::Build { .. } => ImageSource::Build,
            ImageStrategy::Fallback { .. } => ImageSource::Fallback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageResolver {
    config: LocalConfig,
    fallback_image: String,
}

impl ImageResolver {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            fallback_image: GENERIC_IMAGE.to_string(),
        }
    }

    pub fn with_fallback_image(mut self, image: impl Into<String>) -> Self {
        self.fallback_image = image.into();
        self
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    /// Published image for a known agent, honoring the private registry and
    /// publisher account.
    pub fn default_registry_image(&self, agent: &AgentType) -> Option<String> {
        let name = agent.image_name()?;
        let publisher = self
            .config
            .docker_hub_user
            .as_deref()
            .filter(|user| !user.is_empty())
            .unwrap_or(DEFAULT_PUBLISHER);
        let registry = self
            .config
            .private_registry
            .as_deref()
            .map(|r| r.trim_end_matches('/'))
            .filter(|r| !r.is_empty() && *r != DEFAULT_REGISTRY);

        Some(match registry {
            Some(registry) => format!("{}/{}/{}:latest", registry, publisher, name),
            None => format!("{}/{}:latest", publisher, name),
        })
    }

    /// Build definition for `agent`, only when the recipe is present on disk.
    pub fn build_definition(&self, agent: &AgentType) -> Option<BuildDefinition> {
        if !agent.is_known() {
            return None;
        }
        let context = self.config.build_context();
        let dockerfile = context
            .join("assets")
            .join("dockerfiles")
            .join(format!("Dockerfile.{}", agent.as_str()));
        dockerfile.is_file().then(|| BuildDefinition {
            context,
            dockerfile,
        })
    }

    /// Tag given to locally built images.
    pub fn build_tag(agent: Option<&AgentType>) -> String {
        format!(
            "vibekit-{}:latest",
            agent.map(AgentType::as_str).unwrap_or("default")
        )
    }

    fn push_target(&self, agent: &AgentType) -> Option<String> {
        if !self.config.push_images {
            return None;
        }
        let user = self
            .config
            .docker_hub_user
            .as_deref()
            .filter(|u| !u.is_empty())?;
        Some(format!("{}/vibekit-{}:latest", user, agent.as_str()))
    }

    /// Ordered strategies for `agent`. Always ends with the generic image.
    pub fn plan(&self, agent: Option<&AgentType>) -> Vec<ImageStrategy> {
        let mut plan = Vec::new();

        if let Some(agent) = agent {
            let candidates: Vec<String> = self
                .config
                .registry_image_for(agent)
                .map(str::to_string)
                .into_iter()
                .chain(self.default_registry_image(agent))
                .fold(Vec::new(), |mut acc, image| {
                    if !acc.contains(&image) {
                        acc.push(image);
                    }
                    acc
                });
            if !candidates.is_empty() {
                plan.push(ImageStrategy::Registry { candidates });
            }

            if !self.config.prefer_registry_images {
                if let Some(definition) = self.build_definition(agent) {
                    plan.push(ImageStrategy::Build {
                        definition,
                        tag: Self::build_tag(Some(agent)),
                        push_target: self.push_target(agent),
                    });
                }
            }
        }

        plan.push(ImageStrategy::Fallback {
            image: self.fallback_image.clone(),
        });
        plan
    }

    /// Walk the plan until one strategy yields an image.
    pub async fn resolve(
        &self,
        engine: &dyn ContainerEngine,
        agent: Option<&AgentType>,
    ) -> SandboxResult<ImageResolution> {
        let label = agent.map(AgentType::as_str).unwrap_or("default");
        let mut failures = Vec::new();

        for strategy in self.plan(agent) {
            let source = strategy.source();
            match self.attempt(engine, &strategy).await {
                Ok(image) => {
                    info!("Resolved {} image for {}: {}", source, label, image);
                    return Ok(ImageResolution { source, image });
                }
                Err(e) => {
                    warn!("Image strategy {} failed for {}: {}", source, label, e);
                    failures.push(e.to_string());
                }
            }
        }

        Err(SandboxError::Initialization(format!(
            "no image could be resolved for {}: {}",
            label,
            failures.join("; ")
        )))
    }

    async fn attempt(
        &self,
        engine: &dyn ContainerEngine,
        strategy: &ImageStrategy,
    ) -> SandboxResult<ImageRef> {
        let resolution_error = |source| SandboxError::Resolution {
            strategy: strategy.source().to_string(),
            source,
        };

        match strategy {
            ImageStrategy::Registry { candidates } => {
                let mut last_error = None;
                for candidate in candidates {
                    info!("Trying registry image {}", candidate);
                    match engine.pull(candidate).await {
                        Ok(image) => return Ok(image),
                        Err(e) => {
                            warn!("Registry image {} unavailable: {}", candidate, e);
                            last_error = Some(e);
                        }
                    }
                }
                match last_error {
                    Some(e) => Err(resolution_error(e)),
                    None => Err(SandboxError::InvalidArgument(
                        "registry strategy without candidates".to_string(),
                    )),
                }
            }
            ImageStrategy::Build {
                definition,
                tag,
                push_target,
            } => {
                info!("Building {} from {}", tag, definition.dockerfile.display());
                let image = engine
                    .build(definition, tag)
                    .await
                    .map_err(resolution_error)?;
                if let Some(target) = push_target {
                    match engine.push(&image, target).await {
                        Ok(()) => info!("Pushed {} as {}", image, target),
                        Err(e) => warn!("Could not push {}: {}", target, e),
                    }
                }
                Ok(image)
            }
            ImageStrategy::Fallback { image } => {
                info!("Using fallback base image {}", image);
                engine.pull(image).await.map_err(resolution_error)
            }
        }
    }
}
