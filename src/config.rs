//! TOML configuration parsing.
//!
//! All settings live in one file (default `./config/askrepo.toml`),
//! loaded once at process start and passed around read-only:
//!
//! ```toml
//! [data]
//! dir = "./data"
//!
//! [cache]
//! ttl_secs = 900
//! fetch_window_secs = 300
//!
//! [model]
//! provider = "openai-compatible"
//! name = "gpt-4o-mini"
//!
//! [server]
//! bind = "127.0.0.1:7399"
//!
//! [resources.svelte]
//! ref = "https://github.com/sveltejs/svelte"
//! branch = "main"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::reference::{normalize, ResourceRef};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data: DataConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Named resources usable by bare name in requests.
    #[serde(default)]
    pub resources: HashMap<String, ResourceEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// Root for repo checkouts, npm installs, and built collections.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// How long a built collection stays fresh before it is rebuilt.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How long a materialized checkout skips the network entirely.
    #[serde(default = "default_fetch_window_secs")]
    pub fetch_window_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            fetch_window_secs: default_fetch_window_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn fetch_window(&self) -> Duration {
        Duration::from_secs(self.fetch_window_secs)
    }
}

fn default_ttl_secs() -> u64 {
    900
}
fn default_fetch_window_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// `disabled` or `openai-compatible`.
    #[serde(default = "default_model_provider")]
    pub provider: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_model_provider(),
            name: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_model_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7399".to_string()
}

/// A configured named resource.
#[derive(Debug, Deserialize, Clone)]
pub struct ResourceEntry {
    /// Reference string in any form `normalize` accepts.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Branch override for git references.
    #[serde(default)]
    pub branch: Option<String>,
    /// Search-path override for git references.
    #[serde(default)]
    pub search_paths: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    match config.model.provider.as_str() {
        "disabled" | "openai-compatible" => {}
        other => anyhow::bail!(
            "Unknown model provider: '{}'. Must be disabled or openai-compatible.",
            other
        ),
    }

    if config.model.is_enabled() && config.model.name.is_none() {
        anyhow::bail!(
            "model.name must be specified when provider is '{}'",
            config.model.provider
        );
    }

    // Surface bad resource references at startup, not on first use.
    resource_table(&config)?;

    Ok(config)
}

/// Build the name → reference lookup table from configuration. The
/// config key becomes the resource's addressing name, and per-entry
/// `branch` / `search_paths` override whatever the reference string
/// itself carried.
pub fn resource_table(config: &Config) -> Result<HashMap<String, ResourceRef>> {
    let no_names = HashMap::new();
    let mut table = HashMap::new();

    for (name, entry) in &config.resources {
        let mut r = normalize(&entry.reference, &no_names)
            .with_context(|| format!("invalid reference for resource '{}'", name))?;
        if !matches!(r, ResourceRef::Git { .. })
            && (entry.branch.is_some() || !entry.search_paths.is_empty())
        {
            anyhow::bail!(
                "resource '{}': branch and search_paths apply only to git references",
                name
            );
        }
        match &mut r {
            ResourceRef::Git {
                name: n,
                branch,
                search_paths,
                ..
            } => {
                *n = name.clone();
                if entry.branch.is_some() {
                    *branch = entry.branch.clone();
                }
                if !entry.search_paths.is_empty() {
                    *search_paths = entry.search_paths.clone();
                }
            }
            ResourceRef::Npm { name: n, .. } => *n = name.clone(),
            ResourceRef::Local { name: n, .. } => *n = name.clone(),
        }
        table.insert(name.clone(), r);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(content: &str) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("askrepo.toml");
        std::fs::write(&path, content).unwrap();
        (tmp, path)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let (_tmp, path) = write_config("[data]\ndir = \"./data\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.cache.ttl_secs, 900);
        assert_eq!(config.model.provider, "disabled");
        assert_eq!(config.server.bind, "127.0.0.1:7399");
        assert!(config.resources.is_empty());
    }

    #[test]
    fn resource_table_applies_overrides() {
        let (_tmp, path) = write_config(
            r#"
[data]
dir = "./data"

[resources.svelte]
ref = "https://github.com/sveltejs/svelte"
branch = "main"
search_paths = ["packages/svelte"]

[resources.types-node]
ref = "npm:@types/node@22.10.1"
"#,
        );
        let config = load_config(&path).unwrap();
        let table = resource_table(&config).unwrap();

        match &table["svelte"] {
            ResourceRef::Git {
                name,
                branch,
                search_paths,
                ..
            } => {
                assert_eq!(name, "svelte");
                assert_eq!(branch.as_deref(), Some("main"));
                assert_eq!(search_paths, &["packages/svelte".to_string()]);
            }
            other => panic!("expected git ref, got {:?}", other),
        }
        assert_eq!(table["types-node"].name(), "types-node");
        assert_eq!(table["types-node"].target(), "npm:@types/node@22.10.1");
    }

    #[test]
    fn branch_override_on_non_git_resource_rejected() {
        let (_tmp, path) = write_config(
            "[data]\ndir = \"./data\"\n\n[resources.react]\nref = \"npm:react\"\nbranch = \"main\"\n",
        );
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("react"));

        let (_tmp, path) = write_config(
            "[data]\ndir = \"./data\"\n\n[resources.docs]\nref = \"./docs\"\nsearch_paths = [\"guide\"]\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn enabled_model_requires_a_name() {
        let (_tmp, path) = write_config(
            "[data]\ndir = \"./data\"\n\n[model]\nprovider = \"openai-compatible\"\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn unknown_model_provider_rejected() {
        let (_tmp, path) =
            write_config("[data]\ndir = \"./data\"\n\n[model]\nprovider = \"llamafile\"\n");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn bad_resource_reference_fails_at_load() {
        let (_tmp, path) = write_config(
            "[data]\ndir = \"./data\"\n\n[resources.broken]\nref = \"http://github.com/a/b\"\n",
        );
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));
    }
}
