//! Boot stages as data, and the one place that performs them.
//!
//! [`BOOT_STAGES`] describes WHAT runs and in which order; [`run_stage`]
//! dispatches on [`StageKind`] to do it. The sequencer walks the table and
//! decides what happens after each outcome.
//!
//! ```text
//! BootStage (DATA)                      run_stage (LOGIC)
//! ────────────────                      ─────────────────
//! BootStage {                           match kind {
//!   kind: Unlock,                         Unlock => unlock_devices(..),
//!   preconditions: [Param(EncRoot)],      ...
//!   policy: Fatal,                      }
//! }
//! ```

use std::path::Path;

use crate::error::{BootError, BootResult};
use crate::manifest::{KEY_MOUNT, NEW_ROOT};

use super::cmdline::Param;
use super::context::BootContext;
use super::mount::{Mounted, PoolMounter};
use super::system::BootSystem;
use super::unlock::{UnlockCoordinator, UnlockMethod, UnlockTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    LoadModules,
    SettleDevices,
    Keymap,
    Unlock,
    ImportMount,
    ValidateRoot,
    Recover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Runs unconditionally.
    Always,
    /// Runs only when the parameter is on the command line. Optional: an
    /// absent parameter skips the stage.
    Param(Param),
    /// The previous stage completed (succeeded or was not applicable).
    PriorSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// A failure ends the pipeline in the rescue shell.
    Fatal,
    /// A failure is logged and the pipeline moves on. Only honoured for
    /// stages gated by an optional [`Precondition::Param`]; anywhere else
    /// it is treated as [`FailurePolicy::Fatal`].
    SkipIfAbsent,
}

/// Whether the sequencer may re-run a stage after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retries {
    None,
    /// Up to `stage_retries` from the retry policy.
    Policy,
}

#[derive(Debug, Clone)]
pub struct BootStage {
    pub name: &'static str,
    pub kind: StageKind,
    pub preconditions: &'static [Precondition],
    pub retries: Retries,
    pub policy: FailurePolicy,
}

/// What a completed stage asks of the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop here and hand the console to the operator.
    Rescue(String),
}

pub const BOOT_STAGES: &[BootStage] = &[
    BootStage {
        name: "load-modules",
        kind: StageKind::LoadModules,
        preconditions: &[Precondition::Always],
        retries: Retries::None,
        policy: FailurePolicy::Fatal,
    },
    BootStage {
        name: "settle-devices",
        kind: StageKind::SettleDevices,
        preconditions: &[Precondition::PriorSuccess],
        retries: Retries::Policy,
        policy: FailurePolicy::Fatal,
    },
    BootStage {
        name: "keymap",
        kind: StageKind::Keymap,
        preconditions: &[Precondition::Param(Param::Keymap)],
        retries: Retries::None,
        policy: FailurePolicy::SkipIfAbsent,
    },
    BootStage {
        name: "unlock",
        kind: StageKind::Unlock,
        preconditions: &[Precondition::Param(Param::EncRoot)],
        retries: Retries::None,
        policy: FailurePolicy::Fatal,
    },
    BootStage {
        name: "import-mount",
        kind: StageKind::ImportMount,
        preconditions: &[Precondition::PriorSuccess],
        retries: Retries::None,
        policy: FailurePolicy::Fatal,
    },
    BootStage {
        name: "validate-root",
        kind: StageKind::ValidateRoot,
        preconditions: &[Precondition::PriorSuccess],
        retries: Retries::None,
        policy: FailurePolicy::Fatal,
    },
    BootStage {
        name: "recover",
        kind: StageKind::Recover,
        preconditions: &[Precondition::Param(Param::Recover)],
        retries: Retries::None,
        policy: FailurePolicy::Fatal,
    },
];

/// Perform one stage.
pub fn run_stage<S: BootSystem>(
    kind: StageKind,
    ctx: &mut BootContext,
    system: &mut S,
) -> BootResult<Flow> {
    match kind {
        StageKind::LoadModules => load_modules(ctx, system),
        StageKind::SettleDevices => settle_devices(ctx, system),
        StageKind::Keymap => load_keymap(ctx, system),
        StageKind::Unlock => unlock_devices(ctx, system),
        StageKind::ImportMount => import_and_mount(ctx, system),
        StageKind::ValidateRoot => validate_root(ctx, system),
        StageKind::Recover => Ok(Flow::Rescue(
            "recover requested on the kernel command line; root is mounted at /mnt/root".into(),
        )),
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Stage implementations
// ─────────────────────────────────────────────────────────────────────────

fn load_modules<S: BootSystem>(ctx: &mut BootContext, system: &mut S) -> BootResult<Flow> {
    let modules = ctx.manifest().modules.clone();
    for module in &modules {
        tracing::debug!(module = %module.name, "loading");
        system.load_module(module)?;
        ctx.record_module(&module.name);
    }
    Ok(Flow::Continue)
}

fn settle_devices<S: BootSystem>(ctx: &mut BootContext, system: &mut S) -> BootResult<Flow> {
    system.start_udev()?;
    if system.settle(ctx.retry().settle_timeout())? {
        Ok(Flow::Continue)
    } else {
        Err(BootError::TimingFailure("device settling".into()))
    }
}

fn load_keymap<S: BootSystem>(ctx: &mut BootContext, system: &mut S) -> BootResult<Flow> {
    let Some(path) = ctx.params().keymap.clone() else {
        return Ok(Flow::Continue);
    };
    if !system.exists(&path) {
        return Err(BootError::command(
            "loadkeys",
            format!("{} is not in the image", path.display()),
        ));
    }
    system.load_keymap(&path)?;
    Ok(Flow::Continue)
}

fn unlock_devices<S: BootSystem>(ctx: &mut BootContext, system: &mut S) -> BootResult<Flow> {
    let method = ctx.unlock_method();
    let key_path = ctx.key_path();
    mount_key_drive(ctx, system)?;

    let header = ctx.manifest().detached_header.clone();
    let devices = ctx.params().enc_root.clone();
    let attempts = ctx.retry().unlock_attempts;

    let mut coordinator = UnlockCoordinator::new(system, method, key_path, attempts);
    for (index, device) in devices.iter().enumerate() {
        let target = UnlockTarget::luks(device.as_str(), index, header.clone());
        let handle = coordinator.unlock(&target)?;
        tracing::info!(device = %handle.device, mapped = ?handle.mapped, "unlocked");
        ctx.record_unlocked(handle);
    }
    Ok(Flow::Continue)
}

/// Mount `enc_key_drive=` when a keyfile will be read from it. At most once
/// per boot, whichever stage needs it first.
fn mount_key_drive<S: BootSystem>(ctx: &mut BootContext, system: &mut S) -> BootResult<()> {
    if ctx.unlock_method() == UnlockMethod::Passphrase || ctx.key_drive().is_some() {
        return Ok(());
    }
    if let Some(drive) = ctx.params().enc_key_drive.clone() {
        system.mount_key_drive(&drive, Path::new(KEY_MOUNT))?;
        ctx.record_key_drive(&drive);
    }
    Ok(())
}

fn import_and_mount<S: BootSystem>(ctx: &mut BootContext, system: &mut S) -> BootResult<Flow> {
    let request = ctx.import_request();
    let hint = ctx.params().root_dataset().map(str::to_string);
    let options = ctx.params().options.clone();
    let retry = ctx.retry().clone();
    let target = Path::new(NEW_ROOT);

    let (pools, dataset) = {
        let mut mounter = PoolMounter::new(system, &retry);
        let pools = mounter.import(&request)?;
        let dataset = mounter.root_dataset(&pools, hint.as_deref())?;
        (pools, dataset)
    };
    ctx.record_pools(&pools);

    // ZFS native encryption: the key can only be loaded once the pool is in.
    if let Some(encryption_root) = system.locked_encryption_root(&dataset)? {
        mount_key_drive(ctx, system)?;
        let mut coordinator = UnlockCoordinator::new(
            system,
            ctx.unlock_method(),
            ctx.key_path(),
            retry.unlock_attempts,
        );
        let handle = coordinator.unlock(&UnlockTarget::ZfsKey { encryption_root })?;
        ctx.record_unlocked(handle);
    }

    let mut mounter = PoolMounter::new(system, &retry);
    mounter.mount(&dataset, target, options.as_deref())?;
    ctx.set_root(Mounted {
        pools,
        dataset,
        target: target.to_path_buf(),
    });
    Ok(Flow::Continue)
}

fn validate_root<S: BootSystem>(ctx: &mut BootContext, system: &mut S) -> BootResult<Flow> {
    let Some(init) = ctx.init_in_root() else {
        return Err(BootError::RootNotReady("no root filesystem was mounted".into()));
    };
    if !system.exists(&init) {
        return Err(BootError::RootNotReady(format!(
            "{} does not exist",
            init.display()
        )));
    }
    if !system.is_executable(&init) {
        return Err(BootError::RootNotReady(format!(
            "{} is not executable",
            init.display()
        )));
    }
    Ok(Flow::Continue)
}
