//! Scoped setup/teardown guards and their composition stack.
//!
//! Every environment preparation around the destructive installation steps
//! (mounts, the policy-rc.d block, repository configuration, grub
//! diversions) implements [`Guard`]. The orchestrator owns a [`GuardStack`]:
//! guards are entered in acquisition order and exited in strict reverse
//! order, and a failure while entering guard N first unwinds guards 1..N-1
//! before the error propagates. This is the explicit-stack equivalent of
//! nested scope-based cleanup.

use anyhow::Result;
use tracing::debug;

/// A reversible environment preparation.
///
/// Contract: `enter` performs its action only if the precondition is unmet
/// (e.g., the target is not already a mount point); `exit` undoes only what
/// `enter` actually did, so repeated runs against a partially prepared
/// filesystem never tear down state they did not create.
pub trait Guard {
    /// Short name used in log and error messages.
    fn name(&self) -> &'static str;

    /// Performs the preparation.
    fn enter(&mut self) -> Result<()>;

    /// Reverses the preparation. Must be safe to call after a failed or
    /// skipped `enter`.
    fn exit(&mut self) -> Result<()>;
}

/// Stack of entered guards, unwound in reverse order.
#[derive(Default)]
pub struct GuardStack {
    entered: Vec<Box<dyn Guard>>,
}

impl GuardStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the guard and records it for later unwinding.
    ///
    /// If `enter` fails, all previously entered guards are exited (in
    /// reverse order) before the error is returned; exit failures during
    /// that unwind are logged and do not mask the original error.
    pub fn enter(&mut self, mut guard: Box<dyn Guard>) -> Result<()> {
        debug!("entering guard: {}", guard.name());
        match guard.enter() {
            Ok(()) => {
                self.entered.push(guard);
                Ok(())
            }
            Err(e) => {
                if let Err(unwind_err) = self.exit_all() {
                    tracing::error!(
                        "guard unwind after failed {} setup also failed: {:#}",
                        guard.name(),
                        unwind_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Exits all entered guards in reverse order of entry.
    ///
    /// Every guard is attempted even if an earlier exit fails; errors are
    /// collected and reported together.
    pub fn exit_all(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        while let Some(mut guard) = self.entered.pop() {
            debug!("exiting guard: {}", guard.name());
            if let Err(e) = guard.exit() {
                errors.push(format!("{}: {:#}", guard.name(), e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("failed to exit {} guard(s): {}", errors.len(), errors.join("; "))
        }
    }

    /// Number of currently entered guards.
    pub fn len(&self) -> usize {
        self.entered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entered.is_empty()
    }
}
