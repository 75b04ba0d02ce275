//! The chroot mutation driver.
//!
//! [`Chroot::apply`] sequences a set of idempotent, reversible environment
//! preparations (mount table, policy-rc.d block, repository configuration,
//! grub diversions) around the destructive installation steps (commands,
//! kernel swap, deb installs, file writes, snap preseeding). Guards are
//! entered in a fixed order and exited in reverse, with a failure anywhere
//! still unwinding everything that was entered.

pub mod apt;
pub mod divert;
pub mod files;
pub mod guard;
pub mod mount;
pub mod pkg;
pub mod policy_rc;
pub mod ppa;

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::config::{CommandConfig, Config};
use crate::error::ChimgError;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::snap::SnapPreseeder;

use divert::GrubDivertGuard;
use files::FileInstaller;
use guard::GuardStack;
use mount::MountGuard;
use pkg::PackageInstaller;
use policy_rc::PolicyRcGuard;
use ppa::{KeyFetcher, KeyserverFetcher, RepositoryGuard};

const LOCK_FILE: &str = ".rschimg.lock";

/// Rejects concurrent runs against one target filesystem.
///
/// Guard artifacts and apt/dpkg state are per-rootfs; two interleaved runs
/// would tear down each other's preparations.
struct RunLock {
    path: Utf8PathBuf,
}

impl RunLock {
    fn acquire(rootfs: &Utf8Path) -> Result<Self> {
        let path = rootfs.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ChimgError::Precondition(format!(
                    "another run appears to be in progress for this rootfs \
                     (lock file {} exists)",
                    path
                ))
                .into())
            }
            Err(e) => Err(ChimgError::io(format!("failed to create lock file: {}", path), e).into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::error!("failed to remove lock file {}: {}", self.path, e);
        }
    }
}

/// Removes the in-rootfs command script when the invocation is done.
struct ScriptGuard {
    path: Utf8PathBuf,
}

impl Drop for ScriptGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("cleaned up command script: {}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("failed to cleanup command script {}: {}", self.path, e),
        }
    }
}

/// Applies a declarative configuration to a mounted root filesystem.
pub struct Chroot {
    rootfs: Utf8PathBuf,
    config: Config,
    executor: Arc<dyn CommandExecutor>,
    key_fetcher: Arc<dyn KeyFetcher>,
}

impl Chroot {
    pub fn new(rootfs: &Utf8Path, config: Config, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            rootfs: rootfs.to_owned(),
            config,
            executor,
            key_fetcher: Arc::new(KeyserverFetcher),
        }
    }

    /// Replaces the keyserver client. Tests inject a fake here.
    #[must_use]
    pub fn with_key_fetcher(mut self, key_fetcher: Arc<dyn KeyFetcher>) -> Self {
        self.key_fetcher = key_fetcher;
        self
    }

    /// Applies the configured changes.
    ///
    /// Enters all guards, runs the installation steps in order and exits
    /// the guards in reverse, also on failure.
    pub fn apply(&self) -> Result<()> {
        let _lock = RunLock::acquire(&self.rootfs)?;

        let mut guards = GuardStack::new();
        guards
            .enter(Box::new(MountGuard::for_chroot(&self.rootfs, self.executor.clone())))
            .context("failed to set up mounts")?;
        guards
            .enter(Box::new(PolicyRcGuard::new(&self.rootfs)))
            .context("failed to set up policy-rc.d")?;
        guards
            .enter(Box::new(RepositoryGuard::new(
                &self.rootfs,
                self.config.ppas.clone(),
                self.executor.clone(),
                self.key_fetcher.clone(),
            )))
            .context("failed to set up repositories")?;
        guards
            .enter(Box::new(GrubDivertGuard::new(&self.rootfs, self.executor.clone())))
            .context("failed to set up grub diversions")?;

        let run_result = self.run_steps();
        let teardown_result = guards.exit_all();

        match (run_result, teardown_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => Err(e).context("failed to tear down guards"),
            (Err(run_err), Err(tear_err)) => {
                tracing::error!("guard teardown also failed: {:#}", tear_err);
                Err(run_err)
            }
        }
    }

    /// The destructive phase, in its fixed order.
    fn run_steps(&self) -> Result<()> {
        self.run_commands("pre", &self.config.cmds_pre)?;

        match &self.config.kernel {
            Some(kernel) => {
                PackageInstaller::new(&self.rootfs, self.executor.clone())
                    .install_kernel(kernel, self.config.fs.as_ref())?;
            }
            None => info!("no kernel configured"),
        }

        if !self.config.debs.is_empty() {
            info!("installing {} deb package(s)", self.config.debs.len());
            let installer = PackageInstaller::new(&self.rootfs, self.executor.clone());
            for deb in &self.config.debs {
                installer.install_deb(deb)?;
            }
            info!("deb packages installed");
        }

        FileInstaller::new(&self.rootfs).install_all(&self.config.files)?;

        match &self.config.snap {
            Some(snap_config) => {
                let preseeder = SnapPreseeder::new(
                    &self.rootfs,
                    snap_config.clone(),
                    self.executor.clone(),
                );
                preseeder.install_assertions()?;
                preseeder.install_all()?;
                preseeder.preseed()?;
            }
            None => info!("no snap configuration, skipping preseed"),
        }

        self.run_commands("post", &self.config.cmds_post)?;
        info!("chroot changes applied, cleaning up");
        Ok(())
    }

    fn run_commands(&self, phase: &str, cmds: &[CommandConfig]) -> Result<()> {
        for cmd in cmds {
            info!("running {} command: {}", phase, cmd.cmd);
            self.run_command(&cmd.cmd)
                .with_context(|| format!("failed to run {} command: {}", phase, cmd.cmd))?;
        }
        Ok(())
    }

    /// Runs one shell command inside the chroot.
    ///
    /// The command is written as a unique executable script at the rootfs
    /// root (so the chroot'ed shell can see it) and removed afterwards.
    fn run_command(&self, cmd: &str) -> Result<ExecutionResult> {
        let script_name = format!("rschimg-{}.sh", Uuid::new_v4());
        let script_path = self.rootfs.join(&script_name);
        fs::write(&script_path, cmd)
            .map_err(|e| ChimgError::io(format!("failed to write {}", script_path), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script_path, fs::Permissions::from_mode(0o700))
                .map_err(|e| ChimgError::io(format!("failed to chmod {}", script_path), e))?;
        }
        let _guard = ScriptGuard {
            path: script_path,
        };
        let script_arg = format!("/{}", script_name);
        self.executor.execute(&CommandSpec::new(
            "/usr/sbin/chroot",
            [self.rootfs.as_str(), script_arg.as_str()],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DebPackage, FileConfig};
    use std::sync::Mutex;

    struct RecordingExecutor {
        calls: Mutex<Vec<CommandSpec>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_on: None,
            })
        }

        /// Fails the first call whose joined argv contains `needle`.
        fn failing_on(needle: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_on: Some(needle),
            })
        }

        fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        fn commands(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|s| {
                    let mut v = vec![s.command.clone()];
                    v.extend(s.args.iter().cloned());
                    v.join(" ")
                })
                .collect()
        }
    }

    impl CommandExecutor for RecordingExecutor {
        fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
            self.calls.lock().unwrap().push(spec.clone());
            if let Some(needle) = self.fail_on {
                let joined = format!("{} {}", spec.command, spec.args.join(" "));
                if joined.contains(needle) {
                    anyhow::bail!("simulated failure: {}", needle);
                }
            }
            Ok(ExecutionResult::empty())
        }
    }

    fn rootfs() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(path.join("usr/sbin")).unwrap();
        fs::create_dir_all(path.join("usr/bin")).unwrap();
        (dir, path)
    }

    fn base_config() -> Config {
        serde_yaml::from_str("{}").unwrap()
    }

    #[test]
    fn apply_runs_phases_in_order_and_cleans_up() {
        let executor = RecordingExecutor::new();
        let (_dir, rootfs) = rootfs();

        let mut config = base_config();
        config.cmds_pre = vec![CommandConfig {
            cmd: "apt-get clean".to_string(),
        }];
        config.debs = vec![DebPackage {
            name: "fuse3".to_string(),
            hold: true,
        }];
        config.files = vec![FileConfig {
            destination: "etc/motd".to_string(),
            content: Some("welcome\n".to_string()),
            source: None,
            owner: None,
            group: None,
            mode: None,
        }];
        config.cmds_post = vec![CommandConfig {
            cmd: "rm -rf /var/tmp/build".to_string(),
        }];

        let chroot = Chroot::new(&rootfs, config, executor.clone());
        chroot.apply().unwrap();

        let commands = executor.commands();

        // 9 mounts first, 9 umounts last, in reverse order.
        assert!(commands[..9].iter().all(|c| c.starts_with("mount ")));
        let n = commands.len();
        assert!(commands[n - 9..].iter().all(|c| c.starts_with("umount ")));
        assert!(commands[8].contains("/var/cache/apt"));
        assert!(commands[n - 9].contains("/var/cache/apt"));
        assert!(commands[n - 1].ends_with("/dev"));

        // Ordered run phase: index refresh (no PPAs), diversions, pre
        // command, deb install + hold, post command, diversion removal.
        let update_pos = commands.iter().position(|c| c.contains("apt-get update")).unwrap();
        let divert_pos = commands.iter().position(|c| c.contains("dpkg-divert")).unwrap();
        let pre_pos = commands
            .iter()
            .position(|c| c.contains("rschimg-") && !c.contains("umount"))
            .unwrap();
        let install_pos = commands.iter().position(|c| c.contains("apt-get install")).unwrap();
        let hold_pos = commands.iter().position(|c| c.contains("apt-mark hold")).unwrap();
        let undivert_pos = commands
            .iter()
            .position(|c| c.contains("dpkg-divert --remove"))
            .unwrap();
        assert!(update_pos < divert_pos);
        assert!(divert_pos < pre_pos);
        assert!(pre_pos < install_pos);
        assert!(install_pos < hold_pos);
        assert!(hold_pos < undivert_pos);

        // File was materialized; transient artifacts are gone.
        assert_eq!(fs::read_to_string(rootfs.join("etc/motd")).unwrap(), "welcome\n");
        assert!(!rootfs.join("usr/sbin/policy-rc.d").exists());
        assert!(!rootfs.join("usr/bin/systemd-detect-virt").exists());
        assert!(!rootfs.join(LOCK_FILE).exists());
        // command scripts were removed
        assert!(
            fs::read_dir(&rootfs)
                .unwrap()
                .filter_map(|e| e.ok())
                .all(|e| !e.file_name().to_string_lossy().starts_with("rschimg-"))
        );
    }

    #[test]
    fn run_phase_failure_still_unwinds_guards() {
        let executor = RecordingExecutor::failing_on("apt-get install");
        let (_dir, rootfs) = rootfs();

        let mut config = base_config();
        config.debs = vec![DebPackage {
            name: "fuse3".to_string(),
            hold: false,
        }];

        let chroot = Chroot::new(&rootfs, config, executor.clone());
        let err = chroot.apply().unwrap_err();
        assert!(err.to_string().contains("simulated failure"));

        let commands = executor.commands();
        let umounts = commands.iter().filter(|c| c.starts_with("umount ")).count();
        assert_eq!(umounts, 9);
        assert!(commands.iter().any(|c| c.contains("dpkg-divert --remove")));
        assert!(!rootfs.join("usr/sbin/policy-rc.d").exists());
        assert!(!rootfs.join(LOCK_FILE).exists());
    }

    #[test]
    fn guard_setup_failure_unwinds_earlier_guards() {
        // The repository guard's index refresh fails; mounts and the policy
        // block must be released again.
        let executor = RecordingExecutor::failing_on("apt-get update");
        let (_dir, rootfs) = rootfs();

        let chroot = Chroot::new(&rootfs, base_config(), executor.clone());
        let err = chroot.apply().unwrap_err();
        assert!(format!("{:#}", err).contains("failed to set up repositories"));

        let commands = executor.commands();
        let umounts = commands.iter().filter(|c| c.starts_with("umount ")).count();
        assert_eq!(umounts, 9);
        assert!(!rootfs.join("usr/sbin/policy-rc.d").exists());
        // The diversion guard was never entered.
        assert!(commands.iter().all(|c| !c.contains("dpkg-divert")));
    }

    #[test]
    fn apply_configures_and_removes_repository() {
        struct FakeKeyFetcher;
        impl KeyFetcher for FakeKeyFetcher {
            fn fetch(&self, _fingerprint: &str) -> Result<Vec<u8>> {
                Ok(b"-----BEGIN PGP PUBLIC KEY BLOCK-----\n".to_vec())
            }
        }

        let executor = RecordingExecutor::new();
        let (_dir, rootfs) = rootfs();

        let mut config = base_config();
        config.ppas = vec![crate::config::PpaConfig {
            name: "daily".to_string(),
            uri: "https://ppa.launchpadcontent.net/daily/ubuntu".to_string(),
            suites: vec!["noble".to_string()],
            components: vec!["main".to_string()],
            keep: false,
            fingerprint: Some("DBB1FC89762BF6B96707C4059BC0A1A1622CF918".to_string()),
            signed_by: None,
            username: None,
            password: None,
            auth_lines: vec![],
            pin_name: None,
            pin_priority: None,
        }];

        let chroot = Chroot::new(&rootfs, config, executor.clone())
            .with_key_fetcher(Arc::new(FakeKeyFetcher));
        chroot.apply().unwrap();

        let commands = executor.commands();
        assert!(commands.iter().any(|c| c.contains("gpg") && c.contains("--dearmor")));
        // not kept: the repository files are gone again
        assert!(!rootfs.join("etc/apt/sources.list.d/daily.sources").exists());
        assert!(!rootfs.join("etc/apt/trusted.gpg.d/daily.gpg").exists());
    }

    #[test]
    fn concurrent_apply_is_rejected() {
        let executor = RecordingExecutor::new();
        let (_dir, rootfs) = rootfs();
        fs::write(rootfs.join(LOCK_FILE), "").unwrap();

        let chroot = Chroot::new(&rootfs, base_config(), executor.clone());
        let err = chroot.apply().unwrap_err();
        let err = err.downcast_ref::<ChimgError>().expect("typed error");
        assert!(matches!(err, ChimgError::Precondition(_)));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn run_command_writes_script_and_invokes_chroot() {
        let executor = RecordingExecutor::new();
        let (_dir, rootfs) = rootfs();
        let chroot = Chroot::new(&rootfs, base_config(), executor.clone());
        chroot.run_command("echo hello").unwrap();

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "/usr/sbin/chroot");
        assert_eq!(calls[0].args[0], rootfs.as_str());
        assert!(calls[0].args[1].starts_with("/rschimg-"));
        assert!(calls[0].args[1].ends_with(".sh"));
        // script removed after the call
        let script = rootfs.join(calls[0].args[1].trim_start_matches('/'));
        assert!(!script.exists());
    }
}
