//! Grub-related script diversions for kernel replacement.
//!
//! Installing a replacement kernel regenerates the grub configuration, which
//! would probe foreign operating systems (os-prober) and no-op entirely when
//! the build environment looks like a container (systemd-detect-virt).
//! [`GrubDivertGuard`] diverts both scripts for the duration of the run and
//! installs a detect-virt stub that always reports a physical machine.
//! Unlike the other guards the diversion is applied fresh every run and
//! reversed unconditionally at exit.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::guard::Guard;
use crate::error::ChimgError;
use crate::executor::{CommandExecutor, CommandSpec};

const OS_PROBER: &str = "/etc/grub.d/30_os-prober";
const OS_PROBER_DIVERTED: &str = "/etc/grub.d/30_os-prober.dpkg-divert";
const DETECT_VIRT: &str = "/usr/bin/systemd-detect-virt";

// Exit 1 == "not virtualized", so grub hooks run even on container builders.
const DETECT_VIRT_STUB: &str = "#!/bin/sh\nexit 1\n";

/// Guard diverting the grub os-prober hook and `systemd-detect-virt`.
pub struct GrubDivertGuard {
    rootfs: Utf8PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl GrubDivertGuard {
    pub fn new(rootfs: &Utf8Path, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            rootfs: rootfs.to_owned(),
            executor,
        }
    }

    fn chroot_spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv: Vec<String> = vec![self.rootfs.to_string()];
        argv.extend(args.into_iter().map(Into::into));
        CommandSpec::new("chroot", argv)
    }
}

impl Guard for GrubDivertGuard {
    fn name(&self) -> &'static str {
        "grub-diversions"
    }

    fn enter(&mut self) -> Result<()> {
        info!("adding grub diversions");
        // Divert only the scripts we must not run, not grub-probe itself:
        // the search command still needs partition uuids.
        self.executor.execute(&self.chroot_spec([
            "dpkg-divert",
            "--local",
            "--divert",
            OS_PROBER_DIVERTED,
            "--rename",
            OS_PROBER,
        ]))?;

        self.executor.execute(&self.chroot_spec([
            "dpkg-divert",
            "--local",
            "--rename",
            DETECT_VIRT,
        ]))?;

        let stub = self.rootfs.join(DETECT_VIRT.trim_start_matches('/'));
        fs::write(&stub, DETECT_VIRT_STUB)
            .map_err(|e| ChimgError::io(format!("failed to write {}", stub), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&stub, fs::Permissions::from_mode(0o755))
                .map_err(|e| ChimgError::io(format!("failed to chmod {}", stub), e))?;
        }
        info!("grub diversions added");
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        info!("removing grub diversions");
        self.executor.execute(&self.chroot_spec([
            "dpkg-divert",
            "--remove",
            "--local",
            "--divert",
            OS_PROBER_DIVERTED,
            "--rename",
            OS_PROBER,
        ]))?;

        let stub = self.rootfs.join(DETECT_VIRT.trim_start_matches('/'));
        fs::remove_file(&stub)
            .map_err(|e| ChimgError::io(format!("failed to remove {}", stub), e))?;
        self.executor.execute(&self.chroot_spec([
            "dpkg-divert",
            "--remove",
            "--local",
            "--rename",
            DETECT_VIRT,
        ]))?;
        info!("grub diversions removed");
        Ok(())
    }
}
