//! File materialization into the target filesystem.
//!
//! Each declared file is either literal content or a copy from a host
//! source; directory sources are copied recursively, merging into an
//! existing destination tree. Ownership and mode, when declared, apply to
//! the destination root entry only; files inside a copied directory keep
//! their original metadata.

use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::FileConfig;
use crate::error::ChimgError;

/// Installs declared files into a rootfs.
pub struct FileInstaller {
    rootfs: Utf8PathBuf,
}

impl FileInstaller {
    pub fn new(rootfs: &Utf8Path) -> Self {
        Self {
            rootfs: rootfs.to_owned(),
        }
    }

    /// Installs all declared files in order.
    pub fn install_all(&self, files: &[FileConfig]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        info!("installing {} file(s)", files.len());
        for file in files {
            self.install(file)?;
        }
        info!("files installed");
        Ok(())
    }

    /// Installs a single declared file.
    pub fn install(&self, file: &FileConfig) -> Result<()> {
        let dest = self.rootfs.join(file.relative_destination());
        debug!("installing file: {}", dest);

        if let Some(content) = &file.content {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| ChimgError::io(format!("failed to create {}", parent), e))?;
            }
            fs::write(&dest, content)
                .map_err(|e| ChimgError::io(format!("failed to write {}", dest), e))?;
        } else if let Some(source) = &file.source {
            let metadata = fs::metadata(source)
                .map_err(|e| ChimgError::io(format!("failed to read metadata: {}", source), e))?;
            if metadata.is_dir() {
                copy_tree(source, &dest)?;
            } else {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| ChimgError::io(format!("failed to create {}", parent), e))?;
                }
                fs::copy(source, &dest).map_err(|e| {
                    ChimgError::io(format!("failed to copy {} to {}", source, dest), e)
                })?;
            }
        }

        apply_metadata(&dest, file.owner, file.group, file.mode)?;
        Ok(())
    }
}

/// Recursively copies `source` into `dest`, creating and merging
/// directories as needed.
fn copy_tree(source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
            ChimgError::io(format!("failed to walk {}", source), io)
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir yields paths under its root");
        let target = dest.as_std_path().join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| {
                ChimgError::io(format!("failed to create {}", target.display()), e)
            })?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    ChimgError::io(format!("failed to create {}", parent.display()), e)
                })?;
            }
            fs::copy(entry.path(), &target).map_err(|e| {
                ChimgError::io(
                    format!("failed to copy {} to {}", entry.path().display(), target.display()),
                    e,
                )
            })?;
        }
    }
    Ok(())
}

/// Applies owner, group and mode independently; an owner-only or group-only
/// change leaves the other id untouched.
fn apply_metadata(
    path: &Utf8Path,
    owner: Option<u32>,
    group: Option<u32>,
    mode: Option<u32>,
) -> Result<()> {
    #[cfg(unix)]
    if owner.is_some() || group.is_some() {
        std::os::unix::fs::chown(path, owner, group)
            .map_err(|e| ChimgError::io(format!("failed to chown {}", path), e))?;
    }
    if let Some(mode) = mode {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| ChimgError::io(format!("failed to chmod {}", path), e))?;
        }
    }
    Ok(())
}
