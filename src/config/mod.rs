pub mod types;

use std::path::Path;

use anyhow::{Context, Result};

pub use types::{AccessKey, Config};

/// Load and validate a configuration snapshot from a YAML file.
pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config file '{}'", path))?;
    let config: Config = serde_yml::from_str(&content)
        .with_context(|| format!("failed to parse config file '{}'", path))?;
    config.validate()?;
    Ok(config)
}
