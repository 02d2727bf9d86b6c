use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

/// Resolves a binary from an explicit path (file path or command name) or from `PATH`.
#[instrument(level = "debug", ret, err)]
pub fn resolve_binary_path(configured: Option<&str>, default_name: &str) -> Result<PathBuf> {
    if let Some(configured) = configured.map(str::trim).filter(|p| !p.is_empty()) {
        let path = Path::new(configured);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        debug!(configured, "Configured binary is not a file, searching PATH");
        return which::which(configured)
            .with_context(|| format!("Binary '{configured}' not found"));
    }
    which::which(default_name).with_context(|| format!("Binary '{default_name}' not found in PATH"))
}
