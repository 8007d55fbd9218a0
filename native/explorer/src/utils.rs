use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

/// Resolves an executable from a configured path or name, falling back to `PATH` lookup of `name`.
///
/// A configured value containing a path separator must point at an existing file.
#[instrument(level = "debug", ret, err)]
pub fn resolve_binary_path(configured: Option<&str>, name: &str) -> Result<PathBuf> {
    let configured = configured.map(str::trim).filter(|c| !c.is_empty());
    if let Some(configured) = configured {
        let path = Path::new(configured);
        if path.components().count() > 1 || path.is_absolute() {
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
            bail!("{} does not exist or is not a file", path.display());
        }
        if let Ok(found) = which::which(configured) {
            return Ok(found);
        }
        debug!(configured, "Configured binary not found on PATH, trying default name");
    }
    which::which(name).with_context(|| format!("{name} not found on PATH"))
}

/// Replaces characters that are not allowed in file names on any desktop platform
pub fn sanitize_name(name: &str) -> String {
    let sanitized = sanitize_filename::sanitize(name.trim());
    if sanitized.is_empty() { "device".to_string() } else { sanitized }
}
