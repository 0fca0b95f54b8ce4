//! Settings sources: the parsed `instance -> environment -> field` tree.
//!
//! A [`SettingsSource`] is loaded once and never mutated afterwards; share it
//! behind an `Arc`. [`ConfigDir`] reads the conventional on-disk layout:
//!
//! ```text
//! config/
//!   config.toml   env = "prod", [app] name/log_path/log_name
//!   mysql.toml    [orders.prod] host = "..." ...
//!   redis.toml    [cache.prod]  host = "..." ...
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PoolError, PoolResult};

/// Top-level key naming the default environment.
const ENV_FIELD: &str = "env";

/// Directories probed by [`ConfigDir::discover`], in order.
const CONFIG_DIR_CANDIDATES: [&str; 2] = ["./config", "../config"];

/// Read-only configuration tree plus the declared default environment.
#[derive(Clone, Debug, Default)]
pub struct SettingsSource {
    default_env: String,
    tree: toml::Table,
}

impl SettingsSource {
    pub fn new(default_env: impl Into<String>, tree: toml::Table) -> Self {
        Self {
            default_env: default_env.into(),
            tree,
        }
    }

    /// Parse a TOML document whose top-level `env` string names the default
    /// environment.
    pub fn from_toml_str(text: &str) -> PoolResult<Self> {
        let tree: toml::Table = text
            .parse()
            .map_err(|e| PoolError::ConfigLoad(format!("invalid toml: {e}")))?;
        let default_env = match tree.get(ENV_FIELD) {
            Some(toml::Value::String(env)) => env.clone(),
            _ => {
                return Err(PoolError::ConfigLoad(
                    "missing top-level `env` string".to_string(),
                ));
            }
        };
        Ok(Self { default_env, tree })
    }

    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let text = read_file(path)?;
        Self::from_toml_str(&text)
    }

    /// Replace the default environment.
    pub fn with_default_env(self, env: impl Into<String>) -> Self {
        Self {
            default_env: env.into(),
            ..self
        }
    }

    pub fn default_env(&self) -> &str {
        &self.default_env
    }

    /// Look up `tree[name][env]`. Either level missing, or not a table,
    /// yields `None`.
    pub fn section(&self, name: &str, env: &str) -> Option<&toml::Table> {
        self.tree.get(name)?.as_table()?.get(env)?.as_table()
    }
}

/// Application-wide settings from `config.toml`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub env: String,
    #[serde(default)]
    pub app: AppSection,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct AppSection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub log_name: String,
}

/// A directory holding `config.toml` and one `<backend>.toml` per backend.
#[derive(Clone, Debug)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Use `./config`, falling back to `../config` (tests run one level down).
    pub fn discover() -> PoolResult<Self> {
        CONFIG_DIR_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|p| p.is_dir())
            .map(Self::new)
            .ok_or_else(|| {
                PoolError::ConfigLoad(format!(
                    "no config directory found (tried {})",
                    CONFIG_DIR_CANDIDATES.join(", ")
                ))
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn app_config(&self) -> PoolResult<AppConfig> {
        let path = self.root.join("config.toml");
        let text = read_file(&path)?;
        toml::from_str(&text)
            .map_err(|e| PoolError::ConfigLoad(format!("{}: {e}", path.display())))
    }

    /// Load `<backend>.toml`. Its own top-level `env` wins; otherwise the
    /// default environment comes from `config.toml`.
    pub fn source(&self, backend: &str) -> PoolResult<SettingsSource> {
        let path = self.root.join(format!("{backend}.toml"));
        let text = read_file(&path)?;
        let tree: toml::Table = text
            .parse()
            .map_err(|e| PoolError::ConfigLoad(format!("{}: {e}", path.display())))?;

        let default_env = match tree.get(ENV_FIELD).and_then(toml::Value::as_str) {
            Some(env) => env.to_string(),
            None => self.app_config()?.env,
        };

        tracing::debug!(
            path = %path.display(),
            backend,
            default_env = %default_env,
            "loaded settings source"
        );
        Ok(SettingsSource::new(default_env, tree))
    }
}

fn read_file(path: &Path) -> PoolResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| PoolError::ConfigLoad(format!("{}: {e}", path.display())))
}
