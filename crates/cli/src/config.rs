//! Configuration loading for kuberpult-dbctl.

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use kuberpult_core::DbConfig;
use std::path::Path;

/// Environment variables read by clap rather than by the config layer.
const CLI_ONLY_KEYS: [&str; 3] = ["config", "author_name", "author_email"];

/// Layer the TOML file (when present) and `KUBERPULT_` environment variables.
///
/// Nested keys use `__`, e.g. `KUBERPULT_DATABASE__URL`.
pub fn load_config(path: &Path) -> Result<DbConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    let config: DbConfig = figment
        .merge(
            Env::prefixed("KUBERPULT_")
                .split("__")
                .ignore(&CLI_ONLY_KEYS),
        )
        .extract()
        .context("failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}
