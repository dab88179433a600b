pub mod logs;
pub mod ps;
pub mod register;
pub mod serve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::{self, model::NexusConfig};
use crate::registry::{JsonRegistry, Registry, Service};

/// Loaded configuration plus the registry it points at.
pub struct CommandContext {
    pub config: NexusConfig,
    pub registry: Arc<JsonRegistry>,
}

/// Resolve the config and open the registry. `data_dir` overrides the
/// configured data directory.
pub fn load_context(config_file: Option<&Path>, data_dir: Option<&Path>) -> Result<CommandContext> {
    let mut config = config::load_resolved(config_file)?;
    if let Some(dir) = data_dir {
        config.controller.data_dir = absolute(dir)?;
    }
    let path = config.registry_path();
    let registry = JsonRegistry::open(&path)
        .with_context(|| format!("opening registry {}", path.display()))?;
    Ok(CommandContext {
        config,
        registry: Arc::new(registry),
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Find a service by exact id, exact name, or unique id prefix.
pub fn find_service(registry: &dyn Registry, key: &str) -> Result<Service> {
    let services = registry.list()?;
    if let Some(svc) = services.iter().find(|s| s.id == key) {
        return Ok(svc.clone());
    }
    let by_name: Vec<&Service> = services.iter().filter(|s| s.name == key).collect();
    match by_name.len() {
        1 => return Ok(by_name[0].clone()),
        n if n > 1 => bail!(
            "{} services are named '{}'; use an id: {}",
            n,
            key,
            by_name
                .iter()
                .map(|s| s.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        _ => {}
    }
    let by_prefix: Vec<&Service> = services.iter().filter(|s| s.id.starts_with(key)).collect();
    if by_prefix.len() == 1 {
        return Ok(by_prefix[0].clone());
    }

    let suggestion = services
        .iter()
        .map(|s| (s, strsim::jaro_winkler(key, &s.name)))
        .filter(|(_, score)| *score > 0.8)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(s, _)| s.name.clone());
    match suggestion {
        Some(name) => bail!("service '{}' not found (did you mean '{}'?)", key, name),
        None => bail!("service '{}' not found", key),
    }
}
