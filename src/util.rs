use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// User-level settings persisted outside any project checkout. Environment
/// variables always win over these; see `config::load_gateway_config`.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct StoredConfig {
    /// APIM subscription key for the AI Gateway
    pub api_key: Option<String>,
    /// AI Gateway base endpoint, e.g. https://my-apim.azure-api.net
    pub endpoint: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

pub fn load_stored_config() -> Result<StoredConfig> {
    let cfg: StoredConfig = confy::load("foundry-ops", None).context("failed to load config")?;
    Ok(cfg)
}

pub fn save_stored_config(cfg: &StoredConfig) -> Result<()> {
    confy::store("foundry-ops", None, cfg).context("failed to save config")?;
    Ok(())
}

/// Persist an APIM key into the local config (not committed to git)
pub fn set_api_key_in_config(secret: &str) -> Result<()> {
    let mut cfg = load_stored_config().unwrap_or_default();
    cfg.api_key = Some(secret.trim().to_string());
    save_stored_config(&cfg)
}

/// Remove any stored APIM key from the local config
pub fn unset_api_key_in_config() -> Result<()> {
    let mut cfg = load_stored_config().unwrap_or_default();
    cfg.api_key = None;
    save_stored_config(&cfg)
}

/// Resolve a value from an environment variable first, then the stored
/// config, skipping blanks in both.
pub fn env_or_stored(var: &str, stored: Option<&str>) -> Option<String> {
    if let Ok(v) = std::env::var(var) {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return Some(v);
        }
    }
    stored
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn mask_secret(secret: &str) -> String {
    if secret.len() > 8 {
        format!("{}...", &secret[..8])
    } else {
        "...".to_string()
    }
}

use owo_colors::OwoColorize;
use supports_color::Stream;

pub fn color_enabled_stdout() -> bool {
    supports_color::on(Stream::Stdout).is_some()
}

pub fn sym_check(enabled: bool) -> String {
    if enabled { format!("{}", "✔".green().bold()) } else { "✔".to_string() }
}

pub fn sym_cross(enabled: bool) -> String {
    if enabled { format!("{}", "✖".red().bold()) } else { "x".to_string() }
}

pub fn sym_question(enabled: bool) -> String {
    if enabled { format!("{}", "?".cyan().bold()) } else { "?".to_string() }
}

pub fn rule(width: usize) -> String {
    "=".repeat(width)
}
