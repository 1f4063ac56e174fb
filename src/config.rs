//! Configuration for verdict paths and engine tuning.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VERDICT_HOME)
//! 2. Config file ($VERDICT_HOME/config.yaml)
//! 3. Defaults (~/.verdict)

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::generator::GeneratorConfig;
use crate::adapters::webhook::WebhookConfig;
use crate::router::RouterConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<std::result::Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Router lane tuning
    #[serde(default)]
    pub router: Option<RouterConfig>,

    /// Webhook endpoint for approver notifications
    #[serde(default)]
    pub notifier: Option<WebhookConfig>,

    /// Endpoint of the automated decision generator
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,

    /// Directory holding per-request audit trails
    pub decisions_dir: PathBuf,

    pub router: RouterConfig,
    pub notifier: Option<WebhookConfig>,
    pub generator: Option<GeneratorConfig>,
}

/// Engine state directory ($VERDICT_HOME or ~/.verdict)
pub fn verdict_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("VERDICT_HOME") {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".verdict"))
}

/// Directory holding per-request audit trails
pub fn decisions_dir() -> Result<PathBuf> {
    Ok(verdict_home()?.join("decisions"))
}

/// Load and cache the resolved configuration
pub fn get() -> Result<&'static ResolvedConfig> {
    let cached = CONFIG.get_or_init(|| resolve().map_err(|e| format!("{:#}", e)));

    match cached {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("Configuration error: {}", e),
    }
}

fn resolve() -> Result<ResolvedConfig> {
    let home = verdict_home()?;
    let file = load_config_file(&home)?;

    Ok(ResolvedConfig {
        decisions_dir: home.join("decisions"),
        home,
        router: file.router.unwrap_or_default(),
        notifier: file.notifier,
        generator: file.generator,
    })
}

fn load_config_file(home: &std::path::Path) -> Result<ConfigFile> {
    let path = home.join("config.yaml");

    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
