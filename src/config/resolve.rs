use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "nexus.toml";

/// Walk up the directory tree from `start`, checking for `filename` at each level.
/// Returns the full path to the file if found, or None if the root is reached
/// without finding it.
pub fn find_config(start: &Path, filename: &str) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Resolve the config file path. If `cli_file` is provided, verify it exists and
/// return it. Otherwise, search from the current working directory upward for
/// "nexus.toml". Running without any config file is allowed, so a failed
/// search yields `Ok(None)`.
pub fn resolve_config(cli_file: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = cli_file {
        if path.is_file() {
            return Ok(Some(path.canonicalize()?));
        }
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let cwd = std::env::current_dir()?;
    Ok(find_config(&cwd, CONFIG_FILENAME))
}
