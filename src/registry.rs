//! Publish the agent images under the user's own registry account and
//! record them as the preferred registry images.

use crate::agent::AgentType;
use crate::config::LocalConfig;
use crate::engine::{ContainerEngine, ImageRef};
use crate::error::{SandboxError, SandboxResult};
use crate::image::ImageResolver;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub agent_type: AgentType,
    pub success: bool,
    /// Pushed reference, set on success.
    pub image: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    /// True when at least one agent image was pushed.
    pub success: bool,
    pub results: Vec<UploadOutcome>,
}

impl UploadReport {
    pub fn pushed(&self) -> impl Iterator<Item = (&AgentType, &str)> + '_ {
        self.results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.image.as_deref().map(|image| (&r.agent_type, image)))
    }
}

/// Push every known agent's locally built image as
/// `<user>/vibekit-<agent>:latest`, building it first when missing.
pub async fn upload_agent_images(
    engine: &dyn ContainerEngine,
    config: &LocalConfig,
    user: &str,
) -> UploadReport {
    let resolver = ImageResolver::new(config.clone());
    let mut results = Vec::new();

    for agent in AgentType::KNOWN {
        let outcome = upload_one(engine, &resolver, agent, user).await;
        match (&outcome.image, &outcome.error) {
            (Some(image), _) => info!("Pushed {} image as {}", outcome.agent_type, image),
            (None, Some(error)) => warn!("{} image not uploaded: {}", outcome.agent_type, error),
            (None, None) => {}
        }
        results.push(outcome);
    }

    let pushed = results.iter().filter(|r| r.success).count();
    info!("Upload finished: {}/{} agent images pushed", pushed, results.len());
    UploadReport {
        success: pushed > 0,
        results,
    }
}

async fn upload_one(
    engine: &dyn ContainerEngine,
    resolver: &ImageResolver,
    agent: AgentType,
    user: &str,
) -> UploadOutcome {
    let tag = ImageResolver::build_tag(Some(&agent));
    let target = format!("{}/vibekit-{}:latest", user, agent.as_str());

    let local = match engine.image_exists(&tag).await {
        Ok(true) => Ok(ImageRef::new(tag.as_str())),
        Ok(false) => build_local(engine, resolver, &agent, &tag).await,
        Err(e) => {
            warn!("Could not inspect {}: {}", tag, e);
            build_local(engine, resolver, &agent, &tag).await
        }
    };

    let result = match local {
        Ok(image) => engine
            .push(&image, &target)
            .await
            .map_err(|e| e.to_string()),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => UploadOutcome {
            agent_type: agent,
            success: true,
            image: Some(target),
            error: None,
        },
        Err(error) => UploadOutcome {
            agent_type: agent,
            success: false,
            image: None,
            error: Some(error),
        },
    }
}

async fn build_local(
    engine: &dyn ContainerEngine,
    resolver: &ImageResolver,
    agent: &AgentType,
    tag: &str,
) -> Result<ImageRef, String> {
    let Some(definition) = resolver.build_definition(agent) else {
        return Err("no build definition and no local image".to_string());
    };
    info!("Building {} from {}", tag, definition.dockerfile.display());
    engine
        .build(&definition, tag)
        .await
        .map_err(|e| e.to_string())
}

/// Upload the agent images for `user` (or the account the engine is logged
/// into) and return `config` updated to prefer the pushed images.
pub async fn setup_registry(
    engine: &dyn ContainerEngine,
    config: &LocalConfig,
    user: Option<&str>,
) -> SandboxResult<(LocalConfig, UploadReport)> {
    let user = match user.map(str::trim).filter(|u| !u.is_empty()) {
        Some(user) => user.to_string(),
        None => engine.registry_user().await?.ok_or_else(|| {
            SandboxError::Registry(
                "not logged into a registry; run `docker login` first".to_string(),
            )
        })?,
    };
    info!("Setting up registry images for {}", user);

    let report = upload_agent_images(engine, config, &user).await;
    if !report.success {
        return Err(SandboxError::Registry(format!(
            "no agent image could be uploaded for {}",
            user
        )));
    }

    let mut updated = config.clone();
    for (agent, image) in report.pushed() {
        updated
            .registry_images
            .insert(agent.as_str().to_string(), image.to_string());
    }
    updated.docker_hub_user = Some(user);
    updated.last_image_build = Some(Utc::now());
    Ok((updated, report))
}
