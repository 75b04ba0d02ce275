//! Filesystem mounts inside the target rootfs.
//!
//! [`MountGuard`] mounts a fixed table of pseudo-filesystems and scratch
//! tmpfs mounts (plus arbitrary bind mounts) in order and unmounts them in
//! reverse order. A target that is already a mount point is skipped on entry
//! and left alone on exit, which makes repeated runs against the same rootfs
//! idempotent.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::guard::Guard;
use crate::error::ChimgError;
use crate::executor::{CommandExecutor, CommandSpec};

/// One entry of the mount table.
#[derive(Debug, Clone)]
pub struct MountEntry {
    /// Mount source (device name, pseudo-fs label, or bind source path).
    pub source: String,
    /// Absolute target path on the host.
    pub target: Utf8PathBuf,
    /// Filesystem type; `None` for bind mounts.
    pub fstype: Option<String>,
    /// Mount options passed via `-o`.
    pub options: Option<String>,
    /// Use `mount --bind` instead of a typed mount.
    pub bind: bool,
}

impl MountEntry {
    fn fs(
        source: &str,
        target: Utf8PathBuf,
        fstype: &str,
        options: Option<&str>,
    ) -> Self {
        Self {
            source: source.to_string(),
            target,
            fstype: Some(fstype.to_string()),
            options: options.map(str::to_string),
            bind: false,
        }
    }

    fn mount_spec(&self) -> CommandSpec {
        let mut args: Vec<String> = Vec::new();
        if self.bind {
            args.push("--bind".to_string());
            args.push(self.source.clone());
            args.push(self.target.to_string());
        } else {
            args.push(self.source.clone());
            args.push(self.target.to_string());
            if let Some(fstype) = &self.fstype {
                args.push("-t".to_string());
                args.push(fstype.clone());
            }
            if let Some(options) = &self.options {
                args.push("-o".to_string());
                args.push(options.clone());
            }
        }
        CommandSpec::new("mount", args)
    }

    fn umount_spec(&self) -> CommandSpec {
        CommandSpec::new("umount", [self.target.as_str()])
    }
}

/// Returns whether `path` is a mount point, by comparing its device id with
/// its parent's (the same check `os.path.ismount` performs).
pub fn is_mount_point(path: &Utf8Path) -> bool {
    let Ok(stat) = rustix::fs::stat(path.as_std_path()) else {
        return false;
    };
    let parent = path.parent().unwrap_or(path);
    let Ok(parent_stat) = rustix::fs::stat(parent.as_std_path()) else {
        return false;
    };
    // A device boundary against the parent marks a mount point; identical
    // inodes mean path and parent are the same directory (a filesystem
    // root).
    stat.st_dev != parent_stat.st_dev || stat.st_ino == parent_stat.st_ino
}

type MountChecker = Box<dyn Fn(&Utf8Path) -> bool + Send + Sync>;

/// Guard mounting a list of [`MountEntry`]s.
pub struct MountGuard {
    entries: Vec<MountEntry>,
    mounted: Vec<bool>,
    executor: Arc<dyn CommandExecutor>,
    checker: MountChecker,
}

impl MountGuard {
    pub fn new(entries: Vec<MountEntry>, executor: Arc<dyn CommandExecutor>) -> Self {
        let mounted = vec![false; entries.len()];
        Self {
            entries,
            mounted,
            executor,
            checker: Box::new(is_mount_point),
        }
    }

    /// The fixed mount table required for package and snap operations inside
    /// a non-booted rootfs: device and pseudo filesystems plus scratch tmpfs
    /// mounts over /tmp and the apt lists/cache.
    pub fn for_chroot(rootfs: &Utf8Path, executor: Arc<dyn CommandExecutor>) -> Self {
        let entries = vec![
            MountEntry::fs("dev-live", rootfs.join("dev"), "devtmpfs", None),
            MountEntry::fs("devpts-live", rootfs.join("dev/pts"), "devpts", Some("nodev,nosuid")),
            MountEntry::fs("proc-live", rootfs.join("proc"), "proc", None),
            MountEntry::fs("sysfs-live", rootfs.join("sys"), "sysfs", None),
            MountEntry::fs("securityfs", rootfs.join("sys/kernel/security"), "securityfs", None),
            MountEntry::fs("none", rootfs.join("sys/fs/cgroup"), "cgroup2", None),
            MountEntry::fs("none", rootfs.join("tmp"), "tmpfs", None),
            MountEntry::fs("none", rootfs.join("var/lib/apt/lists"), "tmpfs", None),
            MountEntry::fs("none", rootfs.join("var/cache/apt"), "tmpfs", None),
        ];
        Self::new(entries, executor)
    }

    /// A single bind mount of `source` onto `target`.
    pub fn bind(
        source: &Utf8Path,
        target: &Utf8Path,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self::new(
            vec![MountEntry {
                source: source.to_string(),
                target: target.to_owned(),
                fstype: None,
                options: None,
                bind: true,
            }],
            executor,
        )
    }

    /// Replaces the mount-point check. Exists so tests can simulate
    /// already-mounted targets without root privileges.
    #[must_use]
    pub fn with_mount_checker(
        mut self,
        checker: impl Fn(&Utf8Path) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.checker = Box::new(checker);
        self
    }

    fn mount_all(&mut self) -> Result<()> {
        for i in 0..self.entries.len() {
            let entry = &self.entries[i];
            if (self.checker)(&entry.target) {
                info!("{} already mounted", entry.target);
                continue;
            }
            if let Err(e) = fs::create_dir_all(&entry.target) {
                let err = ChimgError::io(
                    format!("failed to create mount point: {}", entry.target),
                    e,
                );
                return Err(self.cleanup_after_error(err.into()));
            }
            info!("mounting {} on {}", entry.source, entry.target);
            let spec = entry.mount_spec();
            match self.executor.execute(&spec) {
                Ok(_) => self.mounted[i] = true,
                Err(e) => return Err(self.cleanup_after_error(e)),
            }
        }
        Ok(())
    }

    /// Unmounts already-mounted entries and returns the original error.
    fn cleanup_after_error(&mut self, error: anyhow::Error) -> anyhow::Error {
        if let Err(unmount_err) = self.unmount_all() {
            tracing::error!("failed to unmount filesystems during cleanup: {:#}", unmount_err);
        }
        error
    }

    fn unmount_all(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        for i in (0..self.entries.len()).rev() {
            if !self.mounted[i] {
                continue;
            }
            let entry = &self.entries[i];
            info!("unmounting {}", entry.target);
            match self.executor.execute(&entry.umount_spec()) {
                Ok(_) => self.mounted[i] = false,
                Err(e) => errors.push(format!("umount {} failed: {:#}", entry.target, e)),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "failed to unmount {} filesystem(s): {}",
                errors.len(),
                errors.join("; ")
            )
        }
    }
}

impl Guard for MountGuard {
    fn name(&self) -> &'static str {
        "mounts"
    }

    fn enter(&mut self) -> Result<()> {
        self.mount_all()
    }

    fn exit(&mut self) -> Result<()> {
        self.unmount_all()
    }
}
