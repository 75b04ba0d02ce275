//! The snapd seed manifest (`seed.yaml`).
//!
//! The manifest is the durable record of every snap slated for preseeding.
//! Two update policies exist and both are supported: a full batch rewrite
//! from the resolved snap set of one run (the primary policy), and an
//! incremental append that skips names already listed. Both produce the same
//! `{snaps: [...]}` shape, so runs may mix them against one filesystem
//! without corrupting the file.

use std::fs;

use anyhow::Result;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::SnapInfo;
use crate::error::ChimgError;

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedEntry {
    pub name: String,
    pub channel: String,
    /// Filename of the `.snap` artifact under the seed's snaps directory.
    pub file: String,
    pub classic: bool,
}

impl From<&SnapInfo> for SeedEntry {
    fn from(info: &SnapInfo) -> Self {
        Self {
            name: info.name.clone(),
            channel: info.channel.clone(),
            file: info.filename.clone(),
            classic: info.classic,
        }
    }
}

/// The `{snaps: [...]}` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedManifest {
    pub snaps: Vec<SeedEntry>,
}

impl SeedManifest {
    /// Reads the manifest at `path`; `Ok(None)` if it does not exist.
    pub fn load(path: &Utf8Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(
                    ChimgError::io(format!("failed to read seed manifest: {}", path), e).into(),
                );
            }
        };
        let manifest: Self = serde_yaml::from_str(&content).map_err(|e| {
            ChimgError::Config(format!("failed to parse seed manifest {}: {}", path, e))
        })?;
        Ok(Some(manifest))
    }

    /// Writes the manifest to `path`, creating parent directories.
    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ChimgError::io(format!("failed to create {}", parent), e))?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| ChimgError::Config(format!("failed to serialize seed manifest: {}", e)))?;
        fs::write(path, yaml)
            .map_err(|e| ChimgError::io(format!("failed to write seed manifest: {}", path), e))?;
        info!("seed manifest written to {}", path);
        Ok(())
    }

    /// Adds an entry unless the name is already listed. Returns whether the
    /// entry was added.
    pub fn add(&mut self, entry: SeedEntry) -> bool {
        if self.snaps.iter().any(|s| s.name == entry.name) {
            warn!("snap {} already listed in seed manifest, skipping", entry.name);
            return false;
        }
        self.snaps.push(entry);
        true
    }

    /// Batch policy: regenerates the manifest at `path` from the complete
    /// resolved snap set of this run, replacing any prior content.
    pub fn rewrite<'a>(
        path: &Utf8Path,
        infos: impl IntoIterator<Item = &'a SnapInfo>,
    ) -> Result<()> {
        let manifest = Self {
            snaps: infos.into_iter().map(SeedEntry::from).collect(),
        };
        manifest.write(path)
    }

    /// Incremental policy: merges one snap into the existing manifest,
    /// skipping (with a warning) names that are already listed.
    pub fn append(path: &Utf8Path, info: &SnapInfo) -> Result<()> {
        let mut manifest = Self::load(path)?.unwrap_or_default();
        manifest.add(SeedEntry::from(info));
        manifest.write(path)
    }
}
