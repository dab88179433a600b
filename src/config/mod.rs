pub mod model;
pub mod resolve;
pub mod validate;

use std::path::Path;

use anyhow::bail;
use model::NexusConfig;

pub fn load_config(path: &Path) -> anyhow::Result<NexusConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let mut config: NexusConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.anchor_paths(base);
    Ok(config)
}

/// Locate, parse and validate the config. Without a config file the defaults
/// are used, anchored at the current directory.
pub fn load_resolved(cli_file: Option<&Path>) -> anyhow::Result<NexusConfig> {
    let config = match resolve::resolve_config(cli_file)? {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            load_config(&path)?
        }
        None => {
            let mut config = NexusConfig::default();
            config.anchor_paths(&std::env::current_dir()?);
            config
        }
    };

    if let Err(errors) = validate::validate(&config) {
        let mut msg = String::from("Configuration errors:\n");
        for err in &errors {
            msg.push_str(&format!("  - {}\n", err));
        }
        bail!("{}", msg.trim_end());
    }

    Ok(config)
}
