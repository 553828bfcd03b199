//! Atomic installation of rendered files.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::TemplateError;

/// Mode for files that carry a secret.
pub const SECRET_MODE: u32 = 0o600;
/// Mode for everything else.
pub const PUBLIC_MODE: u32 = 0o644;

/// What an install did to its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RenderOutcome {
    Written { digest: String },
    Unchanged { digest: String },
}

impl RenderOutcome {
    /// Hex SHA-256 of the installed content.
    pub fn digest(&self) -> &str {
        match self {
            RenderOutcome::Written { digest } | RenderOutcome::Unchanged { digest } => digest,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, RenderOutcome::Written { .. })
    }
}

pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Write `content` to `dest` with `mode`, atomically.
///
/// The content goes to a temp file in the destination directory which is
/// then renamed over `dest`. If `dest` already holds exactly `content` it is
/// left alone apart from correcting its mode.
pub fn install_file(dest: &Path, content: &str, mode: u32) -> Result<RenderOutcome, TemplateError> {
    let install_err = |source: std::io::Error| TemplateError::Install {
        path: dest.to_path_buf(),
        source,
    };

    let digest = content_digest(content.as_bytes());

    if let Ok(existing) = fs::read(dest) {
        if content_digest(&existing) == digest {
            let current = fs::metadata(dest).map_err(install_err)?.permissions().mode() & 0o7777;
            if current != mode {
                fs::set_permissions(dest, fs::Permissions::from_mode(mode)).map_err(install_err)?;
                tracing::info!(path = %dest.display(), mode = %format!("{mode:o}"), "Corrected file mode");
            }
            tracing::debug!(path = %dest.display(), "Content unchanged");
            return Ok(RenderOutcome::Unchanged { digest });
        }
    }

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(install_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(install_err)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(install_err)?;
    tmp.write_all(content.as_bytes()).map_err(install_err)?;
    tmp.as_file().sync_all().map_err(install_err)?;
    tmp.persist(dest).map_err(|e| install_err(e.error))?;

    tracing::info!(path = %dest.display(), digest = %&digest[..12], "Installed file");
    Ok(RenderOutcome::Written { digest })
}

/// Write `content` to a scratch file beside `dest` so a daemon can validate
/// it before anything at `dest` changes.
///
/// The file is removed when the returned handle is dropped.
pub fn scratch_file(dest: &Path, content: &str) -> Result<NamedTempFile, TemplateError> {
    let scratch_err = |source: std::io::Error| TemplateError::Install {
        path: dest.to_path_buf(),
        source,
    };

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(scratch_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".pigate-")
        .suffix(".check")
        .tempfile_in(parent)
        .map_err(scratch_err)?;
    tmp.write_all(content.as_bytes()).map_err(scratch_err)?;
    tmp.as_file().sync_all().map_err(scratch_err)?;
    Ok(tmp)
}

/// Current permission bits of `path`, if it exists.
pub fn existing_mode(path: &Path) -> Option<u32> {
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}
