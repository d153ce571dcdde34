//! Store settings for the CLI
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file given with
//! `--config`, `CKPT_*` environment variables, command-line flags.

use anyhow::{Context, Result};
use checkpoint_store::{StoreConfig, StoreConfigOverrides};
use std::fs;
use std::path::Path;

/// Settings that can be given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database_url: Option<String>,
    pub no_auto_migrate: bool,
}

/// Parse a TOML settings file; absent keys keep their defaults
pub fn load_file(path: &Path) -> Result<StoreConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}

impl From<Overrides> for StoreConfigOverrides {
    fn from(flags: Overrides) -> Self {
        Self {
            database_url: flags.database_url,
            auto_migrate: flags.no_auto_migrate.then_some(false),
            ..Self::default()
        }
    }
}

/// Effective settings from every layer
pub fn resolve(file: Option<&Path>, overrides: Overrides) -> Result<StoreConfig> {
    resolve_with_prefix(file, StoreConfig::ENV_PREFIX, overrides)
}

/// [`resolve`] reading environment variables named `{env_prefix}*`
pub fn resolve_with_prefix(
    file: Option<&Path>,
    env_prefix: &str,
    overrides: Overrides,
) -> Result<StoreConfig> {
    let mut config = match file {
        Some(path) => load_file(path)?,
        None => StoreConfig::default(),
    };

    let env = StoreConfigOverrides::from_env(env_prefix)
        .with_context(|| format!("Invalid {env_prefix}* environment variable"))?;
    config.apply(env).apply(overrides.into());

    config.validate().context("Invalid store settings")?;
    Ok(config)
}
