//! Init-system policy block for package operations in a non-booted rootfs.
//!
//! Installing packages inside a chroot must not start or stop real services.
//! [`PolicyRcGuard`] writes a `policy-rc.d` hook that denies every runlevel
//! operation for the duration of the run. A hook the target already carries
//! is left untouched, on entry and on exit.

use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::guard::Guard;
use crate::error::ChimgError;

const POLICY_RC_PATH: &str = "usr/sbin/policy-rc.d";

const POLICY_RC_SCRIPT: &str = "#!/bin/sh
echo \"All runlevel operations denied by policy\" >&2
exit 101
";

/// Guard writing (and later removing) the deny-all `policy-rc.d` hook.
pub struct PolicyRcGuard {
    path: Utf8PathBuf,
    written: bool,
}

impl PolicyRcGuard {
    pub fn new(rootfs: &Utf8Path) -> Self {
        Self {
            path: rootfs.join(POLICY_RC_PATH),
            written: false,
        }
    }
}

impl Guard for PolicyRcGuard {
    fn name(&self) -> &'static str {
        "policy-rc.d"
    }

    fn enter(&mut self) -> Result<()> {
        if self.path.exists() {
            info!("{} already present, leaving it in place", self.path);
            return Ok(());
        }
        info!("disabling runlevel operations");
        fs::write(&self.path, POLICY_RC_SCRIPT)
            .map_err(|e| ChimgError::io(format!("failed to write {}", self.path), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o755))
                .map_err(|e| ChimgError::io(format!("failed to chmod {}", self.path), e))?;
        }
        self.written = true;
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        if !self.written {
            return Ok(());
        }
        fs::remove_file(&self.path)
            .map_err(|e| ChimgError::io(format!("failed to remove {}", self.path), e))?;
        self.written = false;
        info!("runlevel operations reenabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rootfs() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(path.join("usr/sbin")).unwrap();
        (dir, path)
    }

    #[test]
    fn writes_executable_hook_and_removes_it() {
        let (_dir, rootfs) = rootfs();
        let hook = rootfs.join(POLICY_RC_PATH);

        let mut guard = PolicyRcGuard::new(&rootfs);
        guard.enter().unwrap();
        assert!(hook.exists());
        let content = fs::read_to_string(&hook).unwrap();
        assert!(content.starts_with("#!/bin/sh"));
        assert!(content.contains("exit 101"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&hook).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        guard.exit().unwrap();
        assert!(!hook.exists());
    }

    #[test]
    fn preexisting_hook_is_left_untouched() {
        let (_dir, rootfs) = rootfs();
        let hook = rootfs.join(POLICY_RC_PATH);
        fs::write(&hook, "#!/bin/sh\nexit 0\n").unwrap();

        let mut guard = PolicyRcGuard::new(&rootfs);
        guard.enter().unwrap();
        guard.exit().unwrap();

        assert!(hook.exists());
        assert_eq!(fs::read_to_string(&hook).unwrap(), "#!/bin/sh\nexit 0\n");
    }

    #[test]
    fn exit_without_enter_is_a_noop() {
        let (_dir, rootfs) = rootfs();
        let mut guard = PolicyRcGuard::new(&rootfs);
        guard.exit().unwrap();
    }
}
