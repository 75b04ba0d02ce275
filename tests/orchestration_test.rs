mod helpers;

use std::fs;
use std::sync::{Arc, Mutex};

use rschimg::cli;
use rschimg::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use rschimg::{run_apply, run_validate};

type CommandCalls = Arc<Mutex<Vec<(String, Vec<String>)>>>;

#[derive(Default)]
struct RecordingExecutor {
    calls: CommandCalls,
    fail_on: Option<&'static str>,
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, spec: &CommandSpec) -> anyhow::Result<ExecutionResult> {
        self.calls
            .lock()
            .unwrap()
            .push((spec.command.clone(), spec.args.clone()));
        if let Some(needle) = self.fail_on {
            let joined = format!("{} {}", spec.command, spec.args.join(" "));
            if joined.contains(needle) {
                anyhow::bail!("simulated failure: {}", needle);
            }
        }
        Ok(ExecutionResult::empty())
    }
}

fn apply_args(file: camino::Utf8PathBuf, rootfs: camino::Utf8PathBuf) -> cli::ApplyArgs {
    cli::ApplyArgs {
        common: cli::CommonArgs {
            file,
            log_level: cli::LogLevel::Error,
        },
        rootfs,
    }
}

#[test]
fn run_apply_mounts_installs_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let config = helpers::write_config(
        &dir,
        r#"
debs:
  - name: fuse3
    hold: true
files:
  - destination: /etc/motd
    content: "customized\n"
cmds_post:
  - cmd: apt-get clean
"#,
    );
    let rootfs = helpers::rootfs_skeleton(&dir);

    let calls: CommandCalls = Arc::new(Mutex::new(Vec::new()));
    let executor: Arc<dyn CommandExecutor> = Arc::new(RecordingExecutor {
        calls: Arc::clone(&calls),
        fail_on: None,
    });

    run_apply(&apply_args(config, rootfs.clone()), executor).expect("run_apply should succeed");

    let calls = calls.lock().unwrap();
    let commands: Vec<String> = calls
        .iter()
        .map(|(c, a)| format!("{} {}", c, a.join(" ")))
        .collect();

    // guards around the run: mounts first, umounts last
    assert!(commands.first().unwrap().starts_with("mount "));
    assert!(commands.last().unwrap().starts_with("umount "));
    let mounts = commands.iter().filter(|c| c.starts_with("mount ")).count();
    let umounts = commands.iter().filter(|c| c.starts_with("umount ")).count();
    assert_eq!(mounts, umounts);

    // the declared deb was installed and held
    assert!(commands.iter().any(|c| c.contains("apt-get install") && c.contains("fuse3")));
    assert!(commands.iter().any(|c| c.contains("apt-mark hold fuse3")));

    // the declared file landed in the rootfs
    assert_eq!(fs::read_to_string(rootfs.join("etc/motd")).unwrap(), "customized\n");

    // transient guard artifacts are gone again
    assert!(!rootfs.join("usr/sbin/policy-rc.d").exists());
    assert!(!rootfs.join("usr/bin/systemd-detect-virt").exists());
}

#[test]
fn run_apply_failure_unwinds_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let config = helpers::write_config(&dir, "debs:\n  - name: fuse3\n");
    let rootfs = helpers::rootfs_skeleton(&dir);

    let calls: CommandCalls = Arc::new(Mutex::new(Vec::new()));
    let executor: Arc<dyn CommandExecutor> = Arc::new(RecordingExecutor {
        calls: Arc::clone(&calls),
        fail_on: Some("apt-get install"),
    });

    let err = run_apply(&apply_args(config, rootfs.clone()), executor).unwrap_err();
    assert!(format!("{:#}", err).contains("simulated failure"));

    let calls = calls.lock().unwrap();
    let mounts = calls.iter().filter(|(c, _)| c == "mount").count();
    let umounts = calls.iter().filter(|(c, _)| c == "umount").count();
    assert_eq!(mounts, umounts);
    assert!(!rootfs.join("usr/sbin/policy-rc.d").exists());
}

#[test]
fn run_apply_rejects_missing_rootfs() {
    let dir = tempfile::tempdir().unwrap();
    let config = helpers::write_config(&dir, "{}");

    let executor: Arc<dyn CommandExecutor> = Arc::new(RecordingExecutor::default());
    let err = run_apply(
        &apply_args(config, "/nonexistent/rschimg-rootfs".into()),
        executor,
    )
    .unwrap_err();
    assert!(err.to_string().contains("not a directory"));
}

#[test]
fn run_validate_succeeds_on_valid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = helpers::write_config(&dir, "debs:\n  - name: jq\n");

    run_validate(&cli::ValidateArgs {
        common: cli::CommonArgs {
            file: config,
            log_level: cli::LogLevel::Error,
        },
    })
    .expect("run_validate should succeed");
}

#[test]
fn run_validate_fails_on_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = helpers::write_config(
        &dir,
        "files:\n  - destination: /etc/motd\n",
    );

    let err = run_validate(&cli::ValidateArgs {
        common: cli::CommonArgs {
            file: config,
            log_level: cli::LogLevel::Error,
        },
    })
    .unwrap_err();
    assert!(err.to_string().contains("either 'content' or 'source'"));
}
