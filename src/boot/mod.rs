//! Early-boot runtime executed as `/init` inside the image.
//!
//! ```text
//! /proc/cmdline ─► BootParams ─┐
//!                              ├─► BootContext ─► Sequencer ─► Succeeded ─► switch_root
//! boot.json ────► BootManifest ┘                     │
//!                                                    └────────► RescueShell
//! ```
//!
//! All side effects go through [`BootSystem`]; `zboot-init` passes a
//! [`HostSystem`].

pub mod cmdline;
pub mod context;
pub mod mount;
pub mod rescue;
pub mod sequencer;
pub mod stage;
pub mod system;
pub mod unlock;

#[cfg(test)]
pub(crate) mod fake;

pub use cmdline::BootParams;
pub use context::BootContext;
pub use mount::{Mounted, PoolImportRequest, PoolMounter, PoolSelector};
pub use sequencer::{BootReport, BootState, Outcome, Sequencer};
pub use stage::{BootStage, FailurePolicy, Precondition, StageKind, BOOT_STAGES};
pub use system::{BootSystem, HostSystem};
pub use unlock::{UnlockAttempt, UnlockCoordinator, UnlockMethod, UnlockTarget, UnlockedHandle};

use crate::error::{BootError, BootResult};
use crate::manifest::BootManifest;

/// Run the stage pipeline to a terminal state.
pub fn run<S: BootSystem>(system: &mut S, cmdline: &str, manifest: BootManifest) -> BootReport {
    let params = BootParams::parse(cmdline);
    tracing::info!(
        root = ?params.root,
        pool = ?params.pool_name(),
        encrypted = params.enc_root.len(),
        "starting boot"
    );
    Sequencer::new(system, BootContext::new(params, manifest)).run()
}

/// Hand over to the real init. Only returns on failure.
pub fn switch_root<S: BootSystem>(system: &mut S, report: &BootReport) -> BootResult<()> {
    if report.state != BootState::Succeeded {
        return Err(BootError::RootNotReady("boot pipeline did not succeed".into()));
    }
    let ctx = &report.context;
    let target = ctx
        .switch_root_target()
        .ok_or_else(|| BootError::RootNotReady("no root filesystem was mounted".into()))?;
    let init = ctx.params().init_path();

    tracing::info!(root = %target.display(), init = %init.display(), "switching root");
    system.switch_root(target, &init, &ctx.params().init_args())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::fake::FakeSystem;
    use crate::manifest::{ModuleLoad, CACHEFILE_PATH, NEW_ROOT};
    use std::path::PathBuf;

    fn zfs_manifest() -> BootManifest {
        let mut manifest = BootManifest::new("6.6.30-gentoo");
        manifest.modules = vec![
            ModuleLoad {
                name: "spl".into(),
                path: PathBuf::from("/lib/modules/6.6.30-gentoo/extra/spl.ko"),
            },
            ModuleLoad {
                name: "zfs".into(),
                path: PathBuf::from("/lib/modules/6.6.30-gentoo/extra/zfs.ko"),
            },
        ];
        manifest
    }

    #[test]
    fn test_unencrypted_pool_boots() {
        let mut system = FakeSystem::new()
            .with_pool("tank")
            .with_dataset("tank/ROOT/gentoo")
            .with_executable("/mnt/root/sbin/init");

        let report = run(&mut system, "root=tank/ROOT/gentoo pool=tank", zfs_manifest());
        assert_eq!(report.state, BootState::Succeeded);
        assert_eq!(report.context.switch_root_target(), Some(PathBuf::from(NEW_ROOT).as_path()));
        assert_eq!(report.context.root().unwrap().dataset, "tank/ROOT/gentoo");
        assert!(!report.ran("unlock"));

        switch_root(&mut system, &report).unwrap();
        assert_eq!(system.modules, vec!["spl", "zfs"]);
        assert_eq!(
            system.mounted,
            vec![("tank/ROOT/gentoo".to_string(), PathBuf::from(NEW_ROOT), None)]
        );
        assert_eq!(
            system.switched,
            Some((PathBuf::from(NEW_ROOT), PathBuf::from("/sbin/init"), vec![]))
        );
        assert_eq!(system.rescue_sessions, 0);
    }

    #[test]
    fn test_exhausted_gpg_unlock_never_imports() {
        let mut system = FakeSystem::new()
            .with_secret("decrypted")
            .with_gpg("correct horse", b"decrypted")
            .with_file("/etc/keyfile", b"ciphertext")
            .with_pool("tank")
            .with_dataset("tank/ROOT/gentoo")
            .with_executable("/mnt/root/sbin/init");
        system.answers(["one", "two", "three", "correct horse"]);

        let report = run(
            &mut system,
            "root=tank/ROOT/gentoo enc_root=/dev/sda2 enc_type=key_gpg enc_tries=3",
            zfs_manifest(),
        );
        assert!(matches!(
            report.state,
            BootState::RescueShell { stage: Some("unlock"), ref reason } if reason.contains("3 attempt")
        ));
        assert!(!report.ran("import-mount"));
        assert!(switch_root(&mut system, &report).is_err());
        assert_eq!(system.prompts, 3);
        assert_eq!(system.import_calls, 0);
        assert!(system.opened.is_empty());
        assert!(system.switched.is_none());
    }

    #[test]
    fn test_luks_then_bootfs_single_user() {
        let mut system = FakeSystem::new()
            .with_secret("pw")
            .with_pool("rpool")
            .with_dataset("rpool/ROOT/default")
            .with_bootfs("rpool", "rpool/ROOT/default")
            .with_executable("/mnt/root/sbin/init");
        system.answers(["pw"]);

        let report = run(
            &mut system,
            "root=zfs:AUTO enc_root=/dev/nvme0n1p2,/dev/nvme1n1p2 su options=noatime",
            BootManifest::new("6.6.30"),
        );
        assert_eq!(report.state, BootState::Succeeded);
        assert_eq!(report.context.unlocked().len(), 2);
        switch_root(&mut system, &report).unwrap();

        assert_eq!(system.prompts, 1);
        assert_eq!(
            system.opened,
            vec!["/dev/nvme0n1p2 -> vault_0", "/dev/nvme1n1p2 -> vault_1"]
        );
        assert_eq!(system.mounted[0].2.as_deref(), Some("noatime"));
        assert_eq!(system.switched.unwrap().2, vec!["single"]);
    }

    #[test]
    fn test_device_scan_boots_with_staged_cachefile() {
        let mut system = FakeSystem::new()
            .with_pool("tank")
            .with_dataset("tank/ROOT/gentoo")
            .with_executable("/mnt/root/sbin/init");
        let mut manifest = zfs_manifest();
        manifest.cachefile = Some(PathBuf::from(CACHEFILE_PATH));

        let report = run(&mut system, "root=tank/ROOT/gentoo by=id", manifest);
        assert_eq!(report.state, BootState::Succeeded);
        assert_eq!(system.import_calls, 1);
    }

    #[test]
    fn test_zfs_keyfile_on_key_drive_without_luks() {
        let mut system = FakeSystem::new()
            .with_secret("raw key")
            .with_file("/mnt/key/root.key", b"raw key")
            .with_pool("tank")
            .with_dataset("tank/ROOT/gentoo")
            .with_executable("/mnt/root/sbin/init");
        system.locked.insert("tank/ROOT/gentoo".into(), "tank/ROOT".into());

        let report = run(
            &mut system,
            "root=tank/ROOT/gentoo enc_type=key enc_key=/root.key enc_key_drive=/dev/sdc1",
            zfs_manifest(),
        );
        assert_eq!(report.state, BootState::Succeeded);
        assert!(!report.ran("unlock"));
        assert_eq!(system.key_drives, vec!["/dev/sdc1"]);
        assert_eq!(system.keys_loaded, vec!["tank/ROOT"]);
    }

    #[test]
    fn test_key_drive_mounted_once_for_luks_and_zfs() {
        let mut system = FakeSystem::new()
            .with_secret("raw key")
            .with_file("/mnt/key/root.key", b"raw key")
            .with_pool("tank")
            .with_dataset("tank/ROOT/gentoo")
            .with_executable("/mnt/root/sbin/init");
        system.locked.insert("tank/ROOT/gentoo".into(), "tank/ROOT".into());

        let report = run(
            &mut system,
            "root=tank/ROOT/gentoo enc_root=/dev/sda2 enc_type=key enc_key=/root.key enc_key_drive=/dev/sdc1",
            zfs_manifest(),
        );
        assert_eq!(report.state, BootState::Succeeded);
        assert_eq!(system.key_drives, vec!["/dev/sdc1"]);
        assert_eq!(system.opened, vec!["/dev/sda2 -> vault_0"]);
        assert_eq!(system.keys_loaded, vec!["tank/ROOT"]);
    }

    #[test]
    fn test_recover_stops_after_mount() {
        let mut system = FakeSystem::new()
            .with_pool("tank")
            .with_dataset("tank/root")
            .with_executable("/mnt/root/sbin/init");
        let report = run(&mut system, "root=tank/root recover", BootManifest::new("6.6.30"));
        assert!(matches!(
            report.state,
            BootState::RescueShell { stage: Some("recover"), .. }
        ));
        assert!(report.context.root().is_some());
    }

    #[test]
    fn test_missing_init_drops_to_rescue() {
        let mut system = FakeSystem::new().with_pool("tank").with_dataset("tank/root");
        let report = run(&mut system, "root=tank/root init=/sbin/openrc-init", BootManifest::new("6.6.30"));
        assert!(matches!(
            report.state,
            BootState::RescueShell { stage: Some("validate-root"), ref reason } if reason.contains("openrc-init")
        ));
    }
}
