mod helpers;

use rschimg::config::load_config;
use rschimg::error::ChimgError;

#[test]
fn load_full_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let path = helpers::write_config(
        &dir,
        r#"
kernel: linux-aws
fs:
  root_fs_label: cloudimg-rootfs
ppas:
  - name: cloud-init-daily
    uri: https://ppa.launchpadcontent.net/cloud-init-dev/daily/ubuntu
    suites: [noble]
    components: [main]
    keep: false
    pin_name: LP-PPA-cloud-init-dev-daily
    pin_priority: 1001
debs:
  - name: fuse3
    hold: true
  - name: jq
snap:
  assertion_brand: canonical
  assertion_model: ubuntu-core-22-amd64
  aa_features_path: features
  snaps:
    - name: hello
      channel: latest/stable
    - name: lxd
      channel: 5.21/stable
      classic: false
      revision: "31234"
files:
  - destination: /etc/motd
    content: "welcome\n"
cmds_pre:
  - cmd: apt-get clean
cmds_post:
  - cmd: rm -rf /var/tmp/build
"#,
    );

    let config = load_config(&path).unwrap();
    assert_eq!(config.kernel.as_deref(), Some("linux-aws"));
    assert_eq!(config.fs.unwrap().root_fs_label, "cloudimg-rootfs");
    assert_eq!(config.ppas.len(), 1);
    assert_eq!(config.ppas[0].pin_priority, Some(1001));
    assert_eq!(config.debs.len(), 2);
    assert!(config.debs[0].hold);
    assert!(!config.debs[1].hold);

    let snap = config.snap.unwrap();
    assert_eq!(snap.snaps[1].revision.as_deref(), Some("31234"));
    // relative path resolved against the config file's directory
    let aa = snap.aa_features_path.unwrap();
    assert!(aa.is_absolute());
    assert!(aa.starts_with(path.parent().unwrap()));
}

#[test]
fn file_with_both_content_and_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = helpers::write_config(
        &dir,
        r#"
files:
  - destination: /etc/motd
    content: "welcome\n"
    source: /tmp/motd
"#,
    );

    let err = load_config(&path).unwrap_err();
    let err = err.downcast_ref::<ChimgError>().expect("typed error");
    assert!(matches!(err, ChimgError::Validation(_)));
}

#[test]
fn file_with_neither_content_nor_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = helpers::write_config(
        &dir,
        "files:\n  - destination: /etc/motd\n",
    );

    let err = load_config(&path).unwrap_err();
    assert!(err.to_string().contains("either 'content' or 'source'"));
}

#[test]
fn malformed_yaml_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = helpers::write_config(&dir, "debs: [not, {a: deb\n");

    let err = load_config(&path).unwrap_err();
    let err = err.downcast_ref::<ChimgError>().expect("typed error");
    assert!(matches!(err, ChimgError::Config(_)));
}
