//! Snap download, seeding and preseeding for a non-booted rootfs.
//!
//! The engine walks each configured snap through the same states:
//! downloaded (artifact and assertion fetched from the store and placed
//! under the seed directories), seeded (recorded in the seed manifest) and
//! finally preseeded (snapd's preseeding tool run against the rootfs). Base
//! dependency resolution runs as a second pass after all explicitly
//! requested snaps are present, so an explicit request always wins over an
//! implicitly required base.

pub mod assertion;
pub mod seed;

use std::fs;
use std::sync::{Arc, LazyLock};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::{debug, info};

use crate::chroot::guard::Guard as _;
use crate::chroot::mount::MountGuard;
use crate::config::SnapConfig;
use crate::error::ChimgError;
use crate::executor::{CommandExecutor, CommandSpec};

pub use seed::{SeedEntry, SeedManifest};

const SEED_DIR: &str = "var/lib/snapd/seed";
const SNAP_PRESEED: &str = "/usr/lib/snapd/snap-preseed";

/// `core` and `core<NN>` are self-contained and declare no base.
static CORE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^core(?:\d\d)?$").expect("static regex"));

/// One snap resolved into the target filesystem.
#[derive(Debug, Clone)]
pub struct SnapInfo {
    pub name: String,
    /// On-disk filename of the downloaded `.snap` artifact.
    pub filename: String,
    pub channel: String,
    pub classic: bool,
    /// Full metadata record reported by `snap info --verbose` for the
    /// artifact. External tool output, hence kept as a YAML document.
    pub info: serde_yaml::Value,
}

impl SnapInfo {
    /// The declared base snap, if any.
    pub fn base(&self) -> Option<&str> {
        self.info.get("base").and_then(|v| v.as_str())
    }
}

/// Ordered, name-keyed collection of resolved snaps for one run.
///
/// Insertion order is preserved (it determines manifest order); inserting an
/// existing name replaces the record wholesale.
#[derive(Debug, Default)]
pub struct SnapSet {
    infos: Vec<SnapInfo>,
}

impl SnapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.infos.iter().any(|i| i.name == name)
    }

    pub fn insert(&mut self, info: SnapInfo) {
        if let Some(existing) = self.infos.iter_mut().find(|i| i.name == info.name) {
            *existing = info;
        } else {
            self.infos.push(info);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapInfo> {
        self.infos.iter()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Downloads, seeds and preseeds the configured snaps.
pub struct SnapPreseeder {
    rootfs: Utf8PathBuf,
    config: SnapConfig,
    executor: Arc<dyn CommandExecutor>,
}

impl SnapPreseeder {
    pub fn new(rootfs: &Utf8Path, config: SnapConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            rootfs: rootfs.to_owned(),
            config,
            executor,
        }
    }

    fn seed_path(&self, sub: &str) -> Utf8PathBuf {
        self.rootfs.join(SEED_DIR).join(sub)
    }

    fn seed_yaml_path(&self) -> Utf8PathBuf {
        self.rootfs.join(SEED_DIR).join("seed.yaml")
    }

    fn ensure_seed_dirs(&self) -> Result<()> {
        for sub in ["assertions", "snaps"] {
            let dir = self.seed_path(sub);
            fs::create_dir_all(&dir)
                .map_err(|e| ChimgError::io(format!("failed to create {}", dir), e))?;
        }
        Ok(())
    }

    /// Installs all configured snaps plus their bases and snapd, then
    /// rewrites the seed manifest from the resolved set.
    pub fn install_all(&self) -> Result<()> {
        info!("installing snaps");
        self.ensure_seed_dirs()?;

        let mut set = SnapSet::new();
        for snap in &self.config.snaps {
            let info =
                self.download(&snap.name, &snap.channel, snap.classic, snap.revision.as_deref())?;
            set.insert(info);
        }

        self.resolve_bases(&mut set)?;

        // snapd itself must be seeded; respect an explicit request.
        if !set.contains("snapd") {
            let info = self.download("snapd", "stable", false, None)?;
            set.insert(info);
        }

        SeedManifest::rewrite(&self.seed_yaml_path(), set.iter())?;
        info!("snaps installed");
        Ok(())
    }

    /// Downloads every base required by the set that is not already present.
    ///
    /// Runs after all explicit snaps are downloaded: a base that is also an
    /// explicit request must not be downloaded twice, regardless of the
    /// order the configuration listed it in.
    fn resolve_bases(&self, set: &mut SnapSet) -> Result<()> {
        let mut required: Vec<String> = Vec::new();
        for info in set.iter() {
            if info.name == "snapd" || CORE_NAME.is_match(&info.name) {
                continue;
            }
            let base = info.base().unwrap_or("core");
            if set.contains(base) {
                continue;
            }
            if !required.iter().any(|r| r == base) {
                required.push(base.to_string());
            }
        }
        for base in required {
            debug!("installing required base snap {}", base);
            let info = self.download(&base, "stable", false, None)?;
            set.insert(info);
        }
        Ok(())
    }

    /// Downloads one snap with its store assertion into the seed directories
    /// and returns its resolved record.
    fn download(
        &self,
        name: &str,
        channel: &str,
        classic: bool,
        revision: Option<&str>,
    ) -> Result<SnapInfo> {
        self.ensure_seed_dirs()?;

        let arch = self
            .executor
            .execute(&CommandSpec::new("dpkg", ["--print-architecture"]))?
            .stdout;

        let scratch = tempfile::Builder::new()
            .prefix("rschimg_")
            .tempdir()
            .map_err(|e| ChimgError::io("failed to create snap download directory", e))?;
        let scratch_path = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf())
            .map_err(|p| ChimgError::Resolution(format!("non-UTF-8 temp dir: {}", p.display())))?;

        let mut args = vec![
            "download".to_string(),
            format!("--target-directory={}", scratch_path),
            format!("--channel={}", channel),
        ];
        if let Some(revision) = revision {
            args.push("--revision".to_string());
            args.push(revision.to_string());
        }
        args.push(name.to_string());
        self.executor.execute(
            &CommandSpec::new("snap", args)
                .with_env("UBUNTU_STORE_ARCH", arch.as_str())
                .with_env("SNAPPY_STORE_NO_CDN", "1")
                .with_env("PATH", "/usr/bin"),
        )?;

        let assert_file = sole_artifact(&scratch_path, "assert", name)?;
        let snap_file = sole_artifact(&scratch_path, "snap", name)?;

        // The store API cannot answer channel/revision questions about a
        // local artifact, so the metadata comes from the file itself.
        let info_yaml = self
            .executor
            .execute(&CommandSpec::new(
                "snap",
                ["info", "--verbose", snap_file.as_str()],
            ))?
            .stdout;
        let info: serde_yaml::Value = serde_yaml::from_str(&info_yaml).map_err(|e| {
            ChimgError::Resolution(format!("failed to parse snap info for {}: {}", name, e))
        })?;

        move_into(&assert_file, &self.seed_path("assertions"))?;
        let installed = move_into(&snap_file, &self.seed_path("snaps"))?;
        let filename = installed
            .file_name()
            .expect("moved file has a name")
            .to_string();

        Ok(SnapInfo {
            name: name.to_string(),
            filename,
            channel: channel.to_string(),
            classic,
            info,
        })
    }

    /// Fetches and persists the model / account-key / account assertion
    /// chain. Each step's lookup parameter is extracted from the previous
    /// assertion's text.
    pub fn install_assertions(&self) -> Result<()> {
        info!("installing snap assertions");
        self.ensure_seed_dirs()?;

        let model = self.fetch_assertion(&[
            "model".to_string(),
            "series=16".to_string(),
            format!("model={}", self.config.assertion_model),
            format!("brand-id={}", self.config.assertion_brand),
        ])?;
        let account_key = assertion::scan_field(&model, "sign-key-sha3-384")
            .ok_or_else(|| {
                ChimgError::Resolution(
                    "could not get account key from model assertion".to_string(),
                )
            })?
            .to_string();
        self.write_assertion("model", &model)?;

        let account_key_assertion = self.fetch_assertion(&[
            "account-key".to_string(),
            format!("public-key-sha3-384={}", account_key),
        ])?;
        let account_id = assertion::scan_field(&account_key_assertion, "account-id")
            .ok_or_else(|| {
                ChimgError::Resolution(
                    "could not get account id from account key assertion".to_string(),
                )
            })?
            .to_string();
        self.write_assertion("account-key", &account_key_assertion)?;

        let account_assertion =
            self.fetch_assertion(&["account".to_string(), format!("account-id={}", account_id)])?;
        self.write_assertion("account", &account_assertion)?;

        info!("snap assertions installed");
        Ok(())
    }

    fn fetch_assertion(&self, query: &[String]) -> Result<String> {
        let mut args = vec!["known".to_string(), "--remote".to_string()];
        args.extend_from_slice(query);
        Ok(self.executor.execute(&CommandSpec::new("snap", args))?.stdout)
    }

    fn write_assertion(&self, name: &str, content: &str) -> Result<()> {
        let path = self.seed_path("assertions").join(name);
        fs::write(&path, content)
            .map_err(|e| ChimgError::io(format!("failed to write {}", path), e))?;
        Ok(())
    }

    /// Validates the seed and runs snapd's preseeding tool, rebuilding the
    /// apparmor profile cache afterwards. A missing seed manifest is a
    /// no-op.
    pub fn preseed(&self) -> Result<()> {
        let seed_yaml = self.seed_yaml_path();
        if !seed_yaml.exists() {
            info!("no seed manifest at {}, skipping preseed", seed_yaml);
            return Ok(());
        }

        self.executor.execute(&CommandSpec::new(
            "snap",
            ["debug", "validate-seed", seed_yaml.as_str()],
        ))?;

        let rootfs = self
            .rootfs
            .canonicalize_utf8()
            .map_err(|e| ChimgError::io(format!("failed to resolve {}", self.rootfs), e))?;
        self.executor
            .execute(&CommandSpec::new(SNAP_PRESEED, ["--reset", rootfs.as_str()]))?;
        self.executor.execute(
            &CommandSpec::new(SNAP_PRESEED, [rootfs.as_str()]).with_env("PATH", "/usr/bin"),
        )?;

        self.rebuild_apparmor_cache()
    }

    /// Recompiles apparmor profiles inside the rootfs so the preseeded state
    /// carries a warm cache. When a feature directory is configured it is
    /// bind-mounted over the rootfs' securityfs feature path for the
    /// duration, so profile compilation observes the target kernel's
    /// feature set rather than the host's.
    fn rebuild_apparmor_cache(&self) -> Result<()> {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let args: Vec<String> = vec![
            self.rootfs.to_string(),
            "apparmor_parser".to_string(),
            "--skip-read-cache".to_string(),
            "--write-cache".to_string(),
            "--skip-kernel-load".to_string(),
            "--verbose".to_string(),
            "-j".to_string(),
            jobs.to_string(),
            "/etc/apparmor.d".to_string(),
        ];
        let spec = CommandSpec::new("chroot", args);

        match &self.config.aa_features_path {
            Some(features) => {
                let target = self.rootfs.join("sys/kernel/security/apparmor/features");
                let mut bind = MountGuard::bind(features, &target, self.executor.clone());
                bind.enter()?;
                let run = self.executor.execute(&spec).map(|_| ());
                let unmount = bind.exit();
                run?;
                unmount
            }
            None => self.executor.execute(&spec).map(|_| ()),
        }
    }
}

/// Returns the single file with extension `ext` in `dir`.
///
/// Zero or multiple matches indicate an ambiguous or corrupted download.
fn sole_artifact(dir: &Utf8Path, ext: &str, name: &str) -> Result<Utf8PathBuf> {
    let mut matches = Vec::new();
    let entries = dir
        .read_dir_utf8()
        .map_err(|e| ChimgError::io(format!("failed to read {}", dir), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ChimgError::io(format!("failed to read {}", dir), e))?;
        if entry.path().extension() == Some(ext) {
            matches.push(entry.path().to_owned());
        }
    }
    match matches.len() {
        1 => Ok(matches.remove(0)),
        n => Err(ChimgError::Resolution(format!(
            "expected exactly one .{} file for snap {}, found {}",
            ext, name, n
        ))
        .into()),
    }
}

/// Moves `src` into `dest_dir`, falling back to copy+remove across
/// filesystems.
fn move_into(src: &Utf8Path, dest_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let file_name = src
        .file_name()
        .ok_or_else(|| ChimgError::Resolution(format!("artifact has no file name: {}", src)))?;
    let dest = dest_dir.join(file_name);
    if fs::rename(src, &dest).is_err() {
        fs::copy(src, &dest)
            .map_err(|e| ChimgError::io(format!("failed to copy {} to {}", src, dest), e))?;
        fs::remove_file(src)
            .map_err(|e| ChimgError::io(format!("failed to remove {}", src), e))?;
    }
    Ok(dest)
}
