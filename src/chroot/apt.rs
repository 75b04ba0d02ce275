//! Shared apt invocation helpers.

use camino::Utf8Path;

use crate::executor::{CommandExecutor, CommandSpec};

pub(crate) const DEBIAN_FRONTEND: (&str, &str) = ("DEBIAN_FRONTEND", "noninteractive");

/// Builds a `chroot <rootfs> <args...>` spec with the non-interactive apt
/// frontend selected.
pub(crate) fn chroot_apt_spec<I, S>(rootfs: &Utf8Path, args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut argv: Vec<String> = vec![rootfs.to_string()];
    argv.extend(args.into_iter().map(Into::into));
    CommandSpec::new("/usr/sbin/chroot", argv).with_env(DEBIAN_FRONTEND.0, DEBIAN_FRONTEND.1)
}

/// Refreshes the package index inside the rootfs.
pub(crate) fn update(rootfs: &Utf8Path, executor: &dyn CommandExecutor) -> anyhow::Result<()> {
    executor.execute(&chroot_apt_spec(
        rootfs,
        ["apt-get", "update", "--assume-yes", "--error-on=any"],
    ))?;
    Ok(())
}
