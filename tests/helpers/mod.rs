use std::fs;

use camino::Utf8PathBuf;

/// Writes a configuration document into `dir` and returns its path.
#[allow(dead_code)]
pub fn write_config(dir: &tempfile::TempDir, yaml: &str) -> Utf8PathBuf {
    let path = dir.path().join("rschimg.yaml");
    fs::write(&path, yaml).expect("write config");
    Utf8PathBuf::from_path_buf(path).expect("utf-8 temp path")
}

/// Creates a minimal rootfs skeleton (the directories the transient guard
/// artifacts land in) and returns its path.
#[allow(dead_code)]
pub fn rootfs_skeleton(dir: &tempfile::TempDir) -> Utf8PathBuf {
    let rootfs = Utf8PathBuf::from_path_buf(dir.path().join("rootfs")).expect("utf-8 temp path");
    fs::create_dir_all(rootfs.join("usr/sbin")).expect("create usr/sbin");
    fs::create_dir_all(rootfs.join("usr/bin")).expect("create usr/bin");
    rootfs
}
