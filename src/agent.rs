use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coding agent an instance is provisioned for.
///
/// The five built-in agents have published registry images and build
/// definitions. Any other identifier is carried through as `Custom` and
/// always resolves to the generic fallback image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AgentType {
    Claude,
    Codex,
    OpenCode,
    Gemini,
    Grok,
    Custom(String),
}

impl AgentType {
    /// Agents with a published image and build definition.
    pub const KNOWN: [AgentType; 5] = [
        AgentType::Claude,
        AgentType::Codex,
        AgentType::OpenCode,
        AgentType::Gemini,
        AgentType::Grok,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::OpenCode => "opencode",
            AgentType::Gemini => "gemini",
            AgentType::Grok => "grok",
            AgentType::Custom(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, AgentType::Custom(_))
    }

    /// Repository name of the published image, without registry or publisher.
    pub fn image_name(&self) -> Option<&'static str> {
        match self {
            AgentType::Claude => Some("vibekit-claude"),
            AgentType::Codex => Some("vibekit-codex"),
            AgentType::OpenCode => Some("vibekit-opencode"),
            AgentType::Gemini => Some("vibekit-gemini"),
            AgentType::Grok => Some("vibekit-grok-cli"),
            AgentType::Custom(_) => None,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl From<String> for AgentType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => AgentType::Claude,
            "codex" => AgentType::Codex,
            "opencode" => AgentType::OpenCode,
            "gemini" => AgentType::Gemini,
            "grok" => AgentType::Grok,
            _ => AgentType::Custom(value),
        }
    }
}

impl From<&str> for AgentType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<AgentType> for String {
    fn from(value: AgentType) -> Self {
        value.as_str().to_string()
    }
}
