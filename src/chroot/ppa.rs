//! Additional APT repository (PPA) configuration.
//!
//! [`RepositoryGuard`] turns every declared repository into on-disk APT
//! configuration (deb822 sources file, optional signing key fetched from the
//! keyserver, optional credentials, optional pin preference), refreshes the
//! package index, and removes the configuration again at exit unless the
//! repository is marked `keep`. With no repositories declared the guard
//! still refreshes the index exactly once so later installs see current
//! package lists.

use std::fs;
use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, info, warn};
use url::Url;

use super::apt;
use super::guard::Guard;
use crate::config::PpaConfig;
use crate::error::ChimgError;
use crate::executor::{CommandExecutor, CommandSpec};

const KEYSERVER_LOOKUP: &str = "https://keyserver.ubuntu.com/pks/lookup";

/// Fetches an ASCII-armored public key for a fingerprint.
///
/// The production implementation talks to the Ubuntu keyserver; tests
/// substitute a fake returning canned key material.
pub trait KeyFetcher: Send + Sync {
    fn fetch(&self, fingerprint: &str) -> Result<Vec<u8>>;
}

/// [`KeyFetcher`] backed by the Ubuntu keyserver HTTP lookup endpoint.
#[derive(Debug, Default)]
pub struct KeyserverFetcher;

impl KeyFetcher for KeyserverFetcher {
    fn fetch(&self, fingerprint: &str) -> Result<Vec<u8>> {
        let url = Url::parse_with_params(
            KEYSERVER_LOOKUP,
            &[("op", "get"), ("search", &format!("0x{}", fingerprint))],
        )
        .context("failed to build keyserver lookup URL")?;
        debug!("fetching key from {}", url);
        let response = reqwest::blocking::get(url.clone())
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("keyserver lookup failed: {}", url))?;
        let body = response
            .bytes()
            .context("failed to read keyserver response")?;
        Ok(body.to_vec())
    }
}

/// The four per-repository APT configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum AptFile {
    Sources,
    SigningKey,
    Auth,
    Pin,
}

impl AptFile {
    /// Path of this file for the named repository, relative to the rootfs.
    pub fn rel_path(&self, name: &str) -> String {
        match self {
            Self::Sources => format!("etc/apt/sources.list.d/{}.sources", name),
            Self::SigningKey => format!("etc/apt/trusted.gpg.d/{}.gpg", name),
            Self::Auth => format!("etc/apt/auth.conf.d/{}.conf", name),
            Self::Pin => format!("etc/apt/preferences.d/{}.pref", name),
        }
    }

    fn path(&self, rootfs: &Utf8Path, name: &str) -> Utf8PathBuf {
        rootfs.join(self.rel_path(name))
    }
}

/// Guard configuring all declared repositories for the duration of the run.
pub struct RepositoryGuard {
    rootfs: Utf8PathBuf,
    ppas: Vec<PpaConfig>,
    configured: Vec<bool>,
    executor: Arc<dyn CommandExecutor>,
    key_fetcher: Arc<dyn KeyFetcher>,
}

impl RepositoryGuard {
    pub fn new(
        rootfs: &Utf8Path,
        ppas: Vec<PpaConfig>,
        executor: Arc<dyn CommandExecutor>,
        key_fetcher: Arc<dyn KeyFetcher>,
    ) -> Self {
        let configured = vec![false; ppas.len()];
        Self {
            rootfs: rootfs.to_owned(),
            ppas,
            configured,
            executor,
            key_fetcher,
        }
    }

    /// Fetches the key for `fingerprint`, converts it to binary form via
    /// `gpg --dearmor` and writes it at `dest`.
    fn write_key(&self, fingerprint: &str, dest: &Utf8Path) -> Result<()> {
        let armored = self.key_fetcher.fetch(fingerprint)?;
        let mut tmp = tempfile::Builder::new()
            .prefix("rschimg_")
            .tempfile()
            .context("failed to create temporary key file")?;
        tmp.write_all(&armored)
            .context("failed to write temporary key file")?;
        let tmp_path = tmp.path().to_string_lossy().to_string();
        self.executor.execute(&CommandSpec::new(
            "/usr/bin/gpg",
            ["--yes", "--dearmor", "--output", dest.as_str(), tmp_path.as_str()],
        ))?;
        Ok(())
    }

    fn write_repo_file(path: &Utf8Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ChimgError::io(format!("failed to create {}", parent), e))?;
        }
        fs::write(path, content)
            .map_err(|e| ChimgError::io(format!("failed to write {}", path), e))?;
        Ok(())
    }

    /// Writes the on-disk configuration for a single repository and
    /// refreshes the index.
    fn configure(&self, ppa: &PpaConfig) -> Result<()> {
        info!("adding PPA {}", ppa.name);

        let mut lines = vec![
            format!("X-Repolib-Name: {}", ppa.name),
            "Enabled: yes".to_string(),
            "Types: deb".to_string(),
            format!("URIs: {}", ppa.uri),
            format!("Suites: {}", ppa.suites.join(" ")),
            format!("Components: {}", ppa.components.join(" ")),
        ];

        if ppa.fingerprint.is_some() && ppa.signed_by.is_some() {
            warn!("fingerprint and signed_by are mutually exclusive; using fingerprint");
        }
        if let Some(fingerprint) = &ppa.fingerprint {
            let key_path = AptFile::SigningKey.path(&self.rootfs, &ppa.name);
            if let Some(parent) = key_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| ChimgError::io(format!("failed to create {}", parent), e))?;
            }
            self.write_key(fingerprint, &key_path)?;
            lines.push(format!("Signed-By: /{}", AptFile::SigningKey.rel_path(&ppa.name)));
        } else if let Some(signed_by) = &ppa.signed_by {
            lines.push(format!("Signed-By: {}", signed_by));
        }

        Self::write_repo_file(
            &AptFile::Sources.path(&self.rootfs, &ppa.name),
            &lines.join("\n"),
        )?;

        let mut auth_lines = Vec::new();
        if let (Some(username), Some(password)) = (&ppa.username, &ppa.password) {
            auth_lines.push(format!(
                "machine {} login {} password {}",
                ppa.uri, username, password
            ));
        }
        auth_lines.extend(ppa.auth_lines.iter().cloned());
        if !auth_lines.is_empty() {
            Self::write_repo_file(
                &AptFile::Auth.path(&self.rootfs, &ppa.name),
                &auth_lines.join("\n"),
            )?;
        }

        if let (Some(pin_name), Some(pin_priority)) = (&ppa.pin_name, ppa.pin_priority) {
            Self::write_repo_file(
                &AptFile::Pin.path(&self.rootfs, &ppa.name),
                &format!(
                    "Package: *\nPin: release o={}\nPin-Priority: {}\n",
                    pin_name, pin_priority
                ),
            )?;
        }

        apt::update(&self.rootfs, self.executor.as_ref())?;
        info!("PPA {} added", ppa.name);
        Ok(())
    }

    /// Removes the per-repository files written by [`configure`] and
    /// refreshes the index.
    fn deconfigure(&self, ppa: &PpaConfig) -> Result<()> {
        info!("removing PPA {}", ppa.name);
        for kind in AptFile::iter() {
            let path = kind.path(&self.rootfs, &ppa.name);
            match fs::remove_file(&path) {
                Ok(()) => debug!("removed {} file: {}", kind, path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ChimgError::io(format!("failed to remove {}", path), e).into());
                }
            }
        }
        apt::update(&self.rootfs, self.executor.as_ref())?;
        info!("PPA {} removed", ppa.name);
        Ok(())
    }

    fn teardown_configured(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        for i in (0..self.ppas.len()).rev() {
            if !self.configured[i] {
                continue;
            }
            if self.ppas[i].keep {
                debug!("keeping PPA {}", self.ppas[i].name);
                self.configured[i] = false;
                continue;
            }
            match self.deconfigure(&self.ppas[i]) {
                Ok(()) => self.configured[i] = false,
                Err(e) => errors.push(format!("{}: {:#}", self.ppas[i].name, e)),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("failed to remove {} PPA(s): {}", errors.len(), errors.join("; "))
        }
    }
}

impl Guard for RepositoryGuard {
    fn name(&self) -> &'static str {
        "repositories"
    }

    fn enter(&mut self) -> Result<()> {
        if self.ppas.is_empty() {
            // Still refresh once so subsequent installs see a current index.
            return apt::update(&self.rootfs, self.executor.as_ref());
        }

        for i in 0..self.ppas.len() {
            if let Err(e) = self.configure(&self.ppas[i]) {
                if let Err(teardown_err) = self.teardown_configured() {
                    tracing::error!(
                        "failed to remove PPAs during cleanup: {:#}",
                        teardown_err
                    );
                }
                return Err(e);
            }
            self.configured[i] = true;
        }

        info!("all PPAs set up");
        let policy = self.executor.execute(&apt::chroot_apt_spec(
            &self.rootfs,
            ["apt-cache", "policy"],
        ))?;
        info!("{}", policy.stdout);
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        self.teardown_configured()
    }
}
