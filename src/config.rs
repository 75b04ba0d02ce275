//! Declarative configuration for a customization run.
//!
//! The YAML document is deserialized once into strongly-typed structs and
//! validated before the core runs; the core never reads string-keyed views
//! of the document. Relative paths inside the configuration (the apparmor
//! features directory, file sources, pre-supplied signing key paths) are
//! resolved against the configuration file's own directory.

use std::fs::File;
use std::io::BufReader;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::debug;

use crate::error::ChimgError;

/// A single file to materialize in the target filesystem.
///
/// Exactly one of `content` (literal bytes) or `source` (host path, file or
/// directory) must be given.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Destination path, relative to the rootfs (a leading `/` is ignored).
    pub destination: String,
    /// Literal file content (mutually exclusive with `source`).
    #[serde(default)]
    pub content: Option<String>,
    /// Host path to copy from; a directory is copied recursively
    /// (mutually exclusive with `content`).
    #[serde(default)]
    pub source: Option<Utf8PathBuf>,
    /// Optional numeric owner (uid).
    #[serde(default)]
    pub owner: Option<u32>,
    /// Optional numeric group (gid).
    #[serde(default)]
    pub group: Option<u32>,
    /// Optional numeric mode (e.g. `0o644`).
    #[serde(default)]
    pub mode: Option<u32>,
}

impl FileConfig {
    /// Destination with any leading path separator stripped, so joining to
    /// the rootfs path can never escape it.
    pub fn relative_destination(&self) -> &str {
        self.destination.trim_start_matches('/')
    }

    fn validate(&self) -> Result<(), ChimgError> {
        match (&self.content, &self.source) {
            (None, None) => Err(ChimgError::Validation(format!(
                "file {}: either 'content' or 'source' must be given",
                self.destination
            ))),
            (Some(_), Some(_)) => Err(ChimgError::Validation(format!(
                "file {}: 'content' and 'source' are mutually exclusive",
                self.destination
            ))),
            _ => Ok(()),
        }
    }
}

/// A snap package slated for preseeding.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SnapPackage {
    pub name: String,
    pub channel: String,
    /// Relaxed ("classic") confinement.
    #[serde(default)]
    pub classic: bool,
    /// Optional fixed store revision.
    #[serde(default)]
    pub revision: Option<String>,
}

/// Snap configuration required for preseeding.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SnapConfig {
    /// Brand account id used to fetch the model assertion.
    pub assertion_brand: String,
    /// Model identifier used to fetch the model assertion.
    pub assertion_model: String,
    /// Host directory with the apparmor feature set matching the target
    /// kernel; bind-mounted into the rootfs during preseeding.
    #[serde(default)]
    pub aa_features_path: Option<Utf8PathBuf>,
    pub snaps: Vec<SnapPackage>,
}

/// A deb package to install.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DebPackage {
    pub name: String,
    /// Mark the package as held after installation.
    #[serde(default)]
    pub hold: bool,
}

/// An additional APT repository (PPA) with optional key, auth and pinning.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PpaConfig {
    pub name: String,
    pub uri: String,
    pub suites: Vec<String>,
    pub components: Vec<String>,
    /// Keep the repository configured after the run.
    #[serde(default)]
    pub keep: bool,
    /// Signing key fingerprint; the key is fetched from the keyserver.
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Pre-supplied signing key path inside the rootfs
    /// (ignored when `fingerprint` is also given).
    #[serde(default)]
    pub signed_by: Option<Utf8PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Raw `auth.conf.d` lines appended verbatim.
    #[serde(default)]
    pub auth_lines: Vec<String>,
    #[serde(default)]
    pub pin_name: Option<String>,
    #[serde(default)]
    pub pin_priority: Option<i32>,
}

/// Filesystem options used for bootloader root rewriting.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FilesystemConfig {
    pub root_fs_label: String,
}

/// A shell command run inside the chroot.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub cmd: String,
}

/// The root configuration document.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Kernel deb package name to swap in.
    #[serde(default)]
    pub kernel: Option<String>,
    /// Filesystem options.
    #[serde(default)]
    pub fs: Option<FilesystemConfig>,
    #[serde(default)]
    pub ppas: Vec<PpaConfig>,
    #[serde(default)]
    pub debs: Vec<DebPackage>,
    #[serde(default)]
    pub snap: Option<SnapConfig>,
    #[serde(default)]
    pub files: Vec<FileConfig>,
    /// Commands run before any installation step.
    #[serde(default)]
    pub cmds_pre: Vec<CommandConfig>,
    /// Commands run after all installation steps.
    #[serde(default)]
    pub cmds_post: Vec<CommandConfig>,
}

impl Config {
    /// Validates cross-field invariants the type system cannot express.
    pub fn validate(&self) -> Result<(), ChimgError> {
        for file in &self.files {
            file.validate()?;
        }
        for ppa in &self.ppas {
            if ppa.suites.is_empty() {
                return Err(ChimgError::Validation(format!(
                    "ppa {}: at least one suite is required",
                    ppa.name
                )));
            }
            if ppa.components.is_empty() {
                return Err(ChimgError::Validation(format!(
                    "ppa {}: at least one component is required",
                    ppa.name
                )));
            }
        }
        Ok(())
    }

    /// Resolves relative host paths against the configuration file's
    /// directory.
    fn resolve_paths(&mut self, config_dir: &Utf8Path) {
        let resolve = |path: Utf8PathBuf| {
            if path.is_relative() {
                config_dir.join(path)
            } else {
                path
            }
        };
        if let Some(snap) = &mut self.snap {
            snap.aa_features_path = snap.aa_features_path.take().map(resolve);
        }
        for file in &mut self.files {
            file.source = file.source.take().map(resolve);
        }
    }
}

/// Loads, resolves and validates a configuration file.
pub fn load_config(path: &Utf8Path) -> Result<Config> {
    let file = File::open(path)
        .map_err(|e| ChimgError::io(format!("failed to open config file: {}", path), e))?;
    let reader = BufReader::new(file);
    let mut config: Config = serde_yaml::from_reader(reader)
        .map_err(|e| ChimgError::Config(format!("failed to parse {}: {}", path, e)))?;

    let config_dir = path.parent().unwrap_or(Utf8Path::new("."));
    config.resolve_paths(config_dir);
    config.validate()?;
    debug!("config loaded as: {:?}", config);
    Ok(config)
}
