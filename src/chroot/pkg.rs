//! Deb package and kernel installation inside the rootfs.
//!
//! Plain packages are installed with apt's non-interactive frontend and
//! optionally marked held. The kernel swap is more involved: every installed
//! `linux-*` package is purged, the requested kernel installed, and the boot
//! path rewritten. A `GRUB_FORCE_PARTUUID` fragment (boot without an
//! initramfs) is preferred when the underlying partition exposes a stable
//! identifier; otherwise the generated grub.cfg gets a `root=LABEL=`
//! rewrite, since partition UUIDs do not survive the image copies this tool
//! is typically used for.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::apt::{self, chroot_apt_spec};
use crate::config::{DebPackage, FilesystemConfig};
use crate::error::ChimgError;
use crate::executor::{CommandExecutor, CommandSpec};

const FORCE_PARTUUID_FRAGMENT: &str = "etc/default/grub.d/40-force-partuuid.cfg";
const GRUB_CFG: &str = "boot/grub/grub.cfg";

/// Installs deb packages and kernels into a rootfs.
pub struct PackageInstaller {
    rootfs: Utf8PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl PackageInstaller {
    pub fn new(rootfs: &Utf8Path, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            rootfs: rootfs.to_owned(),
            executor,
        }
    }

    /// Installs a single deb package, optionally holding it afterwards.
    pub fn install_deb(&self, deb: &DebPackage) -> Result<()> {
        self.executor.execute(&chroot_apt_spec(
            &self.rootfs,
            [
                "apt-get",
                "install",
                "--assume-yes",
                "--allow-downgrades",
                deb.name.as_str(),
            ],
        ))?;
        if deb.hold {
            self.executor.execute(&chroot_apt_spec(
                &self.rootfs,
                ["apt-mark", "hold", deb.name.as_str()],
            ))?;
        }
        Ok(())
    }

    /// Swaps the installed kernel for `kernel`.
    ///
    /// Purges all current kernel packages, refreshes the index, installs the
    /// requested one and rewrites the boot path (see module docs).
    pub fn install_kernel(&self, kernel: &str, fs_config: Option<&FilesystemConfig>) -> Result<()> {
        info!("installing kernel {}", kernel);
        // The purge pattern must reach apt unexpanded, hence the shell.
        self.executor.execute(
            &chroot_apt_spec(
                &self.rootfs,
                [
                    "apt-get",
                    "remove",
                    "--purge",
                    "--assume-yes",
                    "--allow-change-held-packages",
                    "'^linux-.*'",
                    "linux-base+",
                ],
            )
            .with_shell(),
        )?;
        apt::update(&self.rootfs, self.executor.as_ref())?;
        self.executor.execute(&chroot_apt_spec(
            &self.rootfs,
            ["apt-get", "install", "--assume-yes", kernel],
        ))?;
        info!("kernel installed");

        self.force_boot_without_initramfs()?;
        self.replace_grub_root_with_label(fs_config)?;
        Ok(())
    }

    /// Discovers the partition UUID backing the rootfs and, when found,
    /// writes the grub fragment forcing boot without an initramfs.
    ///
    /// Empty `findmnt`/`blkid` output is a legitimate skip: the rootfs may
    /// live on a filesystem with no stable partition identity.
    fn force_boot_without_initramfs(&self) -> Result<()> {
        let source = self
            .executor
            .execute(&CommandSpec::new(
                "findmnt",
                ["-n", "-o", "SOURCE", "--target", self.rootfs.as_str()],
            ))?
            .stdout;
        if source.is_empty() {
            return Ok(());
        }
        let partuuid = self
            .executor
            .execute(&CommandSpec::new(
                "blkid",
                ["-s", "PARTUUID", "-o", "value", source.as_str()],
            ))?
            .stdout;
        if partuuid.is_empty() {
            return Ok(());
        }

        info!("forcing boot without initramfs with PARTUUID={}", partuuid);
        let fragment = self.rootfs.join(FORCE_PARTUUID_FRAGMENT);
        if let Some(parent) = fragment.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ChimgError::io(format!("failed to create {}", parent), e))?;
        }
        fs::write(
            &fragment,
            format!(
                "# Force boot without an initramfs by setting GRUB_FORCE_PARTUUID\n\
                 # Remove this line to enable boot with an initramfs\n\
                 GRUB_FORCE_PARTUUID={}\n",
                partuuid
            ),
        )
        .map_err(|e| ChimgError::io(format!("failed to write {}", fragment), e))?;

        let mut argv = vec![self.rootfs.to_string()];
        argv.push("update-grub".to_string());
        self.executor.execute(&CommandSpec::new("chroot", argv))?;
        Ok(())
    }

    /// Rewrites `root=...` to `root=LABEL=<label>` in the generated
    /// grub.cfg, unless the force-partuuid fragment already pins the boot
    /// path or no label is configured.
    fn replace_grub_root_with_label(&self, fs_config: Option<&FilesystemConfig>) -> Result<()> {
        if self.rootfs.join(FORCE_PARTUUID_FRAGMENT).exists() {
            return Ok(());
        }
        let Some(fs_config) = fs_config else {
            info!("no filesystem configured");
            return Ok(());
        };
        let grub_cfg = self.rootfs.join(GRUB_CFG);
        if !grub_cfg.exists() {
            return Ok(());
        }
        self.executor.execute(
            &CommandSpec::new(
                "sed",
                [
                    "-i".to_string(),
                    "-e".to_string(),
                    format!("\"s,root=[^ ]*,root=LABEL={},\"", fs_config.root_fs_label),
                    grub_cfg.to_string(),
                ],
            )
            .with_shell(),
        )?;
        Ok(())
    }
}
