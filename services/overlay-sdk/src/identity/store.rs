//! Identity file persistence
//!
//! Bundles are written to a sibling temp file, synced, then renamed over the
//! target, so a reader sees either the previous file or the complete new one.
//! File system access only; no network calls.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::CredentialBundle;
use crate::error::{OverlayError, Result};

/// Load and validate a bundle
pub fn load(path: &Path) -> Result<CredentialBundle> {
    debug!(path = %path.display(), "Loading identity");

    let raw = fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => OverlayError::IdentityNotFound(path.to_path_buf()),
        _ => OverlayError::Storage {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    let bundle: CredentialBundle =
        serde_json::from_slice(&raw).map_err(|e| OverlayError::IdentityCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    bundle
        .validate()
        .map_err(|reason| OverlayError::IdentityCorrupt {
            path: path.to_path_buf(),
            reason,
        })?;

    Ok(bundle)
}

/// Persist a bundle, replacing any existing file at `path`
pub fn save(bundle: &CredentialBundle, path: &Path) -> Result<()> {
    bundle
        .validate()
        .map_err(|reason| OverlayError::IdentityCorrupt {
            path: path.to_path_buf(),
            reason,
        })?;

    let json = serde_json::to_vec_pretty(bundle).map_err(|e| OverlayError::IdentityCorrupt {
        path: path.to_path_buf(),
        reason: format!("serialize: {}", e),
    })?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| storage(&dir, e))?;

    let tmp = temp_path(path);
    if let Err(e) = write_synced(&tmp, &json) {
        let _ = fs::remove_file(&tmp);
        return Err(storage(&tmp, e));
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        storage(path, e)
    })?;

    #[cfg(unix)]
    if let Ok(dir_fd) = fs::File::open(&dir) {
        let _ = dir_fd.sync_all();
    }

    // Read back what landed on disk
    let stored = load(path)?;
    if stored != *bundle {
        return Err(OverlayError::IdentityCorrupt {
            path: path.to_path_buf(),
            reason: "stored identity differs from the written bundle".to_string(),
        });
    }

    info!(path = %path.display(), identity = %bundle.name, "Identity stored");
    Ok(())
}

/// Delete a stored identity; a missing file is not an error
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "Identity file removed");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(storage(path, e)),
    }
}

pub fn exists(path: &Path) -> bool {
    path.is_file()
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut f = fs::File::create(path)?;

    // Private key material: owner read/write only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        f.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    f.write_all(data)?;
    f.flush()?;
    f.sync_all()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "identity".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn storage(path: &Path, source: std::io::Error) -> OverlayError {
    OverlayError::Storage {
        path: path.to_path_buf(),
        source,
    }
}
