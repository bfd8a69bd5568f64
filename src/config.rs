use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::{env_or_stored, load_stored_config};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_API_VERSION: &str = "2025-03-01-preview";

/// Connection settings for the AI Gateway, assembled once at process start
/// and handed by reference to every client. Nothing below this layer reads
/// the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub api_key: String,
    pub default_model: String,
    pub api_version: String,
}

impl GatewayConfig {
    /// Base URL for the Assistants and Responses APIs. The doubled segment
    /// is the APIM route prefix in front of the Azure OpenAI path.
    pub fn base_url_openai(&self) -> String {
        format!("{}/openai/openai", self.endpoint)
    }

    /// Base URL for Chat Completions, which addresses a deployment.
    pub fn deployments_url(&self, model: &str) -> String {
        format!("{}/openai/openai/deployments/{}", self.endpoint, model)
    }
}

/// Environment first (`APIM_ENDPOINT`, `APIM_API_KEY`, `DEFAULT_MODEL`,
/// `API_VERSION`), then the stored user config.
pub fn load_gateway_config() -> Result<GatewayConfig> {
    let stored = load_stored_config().unwrap_or_default();

    let endpoint = env_or_stored("APIM_ENDPOINT", stored.endpoint.as_deref())
        .context("APIM_ENDPOINT is not set. Export it or store one with 'foundry-ops auth'.")?;
    let api_key = env_or_stored("APIM_API_KEY", stored.api_key.as_deref()).context(
        "APIM_API_KEY is not set. Find the key under Azure Portal -> APIM -> Subscriptions, \
         then export it or store it with 'foundry-ops auth'.",
    )?;

    Ok(GatewayConfig {
        endpoint: endpoint.trim_end_matches('/').to_string(),
        api_key,
        default_model: env_or_stored("DEFAULT_MODEL", stored.default_model.as_deref())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        api_version: env_or_stored("API_VERSION", stored.api_version.as_deref())
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
    })
}

/// Optional YAML description of a hosted-agent deployment, so `agent create`
/// doesn't need six flags every time. CLI flags override manifest fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentManifest {
    pub name: Option<String>,
    pub image: Option<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

pub fn load_agent_manifest(path: &Path) -> Result<AgentManifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;

    let manifest: AgentManifest = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;

    Ok(manifest)
}
