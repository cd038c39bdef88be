//! Warm the local image cache for every built-in agent.

use crate::agent::AgentType;
use crate::config::LocalConfig;
use crate::engine::ContainerEngine;
use crate::image::ImageResolver;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How an agent's image ended up in the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrebuildSource {
    Cached,
    Registry,
    Dockerfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuildOutcome {
    pub agent_type: AgentType,
    pub success: bool,
    pub source: Option<PrebuildSource>,
    pub image: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrebuildReport {
    /// True when at least one agent has a usable image.
    pub success: bool,
    pub results: Vec<PrebuildOutcome>,
}

/// Make sure each known agent's image is available locally, trying the
/// local cache, then the registry, then a build from its definition.
pub async fn prebuild_agent_images(
    engine: &dyn ContainerEngine,
    config: &LocalConfig,
) -> PrebuildReport {
    let resolver = ImageResolver::new(config.clone());
    let mut results = Vec::new();

    for agent in AgentType::KNOWN {
        info!("Preparing image for {}", agent);
        let outcome = prebuild_one(engine, &resolver, agent).await;
        match (&outcome.source, &outcome.error) {
            (Some(source), _) => info!("{} image ready ({:?})", outcome.agent_type, source),
            (None, Some(error)) => warn!("{} image unavailable: {}", outcome.agent_type, error),
            (None, None) => {}
        }
        results.push(outcome);
    }

    let ready = results.iter().filter(|r| r.success).count();
    info!("Prebuild finished: {}/{} agent images ready", ready, results.len());
    PrebuildReport {
        success: ready > 0,
        results,
    }
}

async fn prebuild_one(
    engine: &dyn ContainerEngine,
    resolver: &ImageResolver,
    agent: AgentType,
) -> PrebuildOutcome {
    let registry_image = resolver
        .config()
        .registry_image_for(&agent)
        .map(str::to_string)
        .or_else(|| resolver.default_registry_image(&agent));
    let mut errors = Vec::new();

    if let Some(image) = &registry_image {
        match engine.image_exists(image).await {
            Ok(true) => return ready(agent, PrebuildSource::Cached, image.clone()),
            Ok(false) => {}
            Err(e) => warn!("Could not inspect {}: {}", image, e),
        }
        match engine.pull(image).await {
            Ok(pulled) => return ready(agent, PrebuildSource::Registry, pulled.to_string()),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if let Some(definition) = resolver.build_definition(&agent) {
        let tag = ImageResolver::build_tag(Some(&agent));
        match engine.build(&definition, &tag).await {
            Ok(built) => return ready(agent, PrebuildSource::Dockerfile, built.to_string()),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if errors.is_empty() {
        errors.push("no registry image or build definition available".to_string());
    }
    PrebuildOutcome {
        agent_type: agent,
        success: false,
        source: None,
        image: None,
        error: Some(errors.join("; ")),
    }
}

fn ready(agent: AgentType, source: PrebuildSource, image: String) -> PrebuildOutcome {
    PrebuildOutcome {
        agent_type: agent,
        success: true,
        source: Some(source),
        image: Some(image),
        error: None,
    }
}
