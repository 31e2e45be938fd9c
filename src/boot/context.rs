//! State discovered while booting, threaded through every stage.
//!
//! The context only grows: stages append what they found (modules loaded,
//! devices unlocked, pools imported) and the root is recorded once. Nothing
//! recorded by an earlier stage is rewritten by a later one.

use std::path::{Path, PathBuf};

use crate::manifest::{BootManifest, RetryPolicy, KEYFILE_PATH, KEY_MOUNT};

use super::cmdline::BootParams;
use super::mount::{Mounted, PoolImportRequest, PoolSelector};
use super::unlock::{UnlockMethod, UnlockedHandle};

#[derive(Debug, Clone)]
pub struct BootContext {
    params: BootParams,
    manifest: BootManifest,
    retry: RetryPolicy,
    loaded_modules: Vec<String>,
    unlocked: Vec<UnlockedHandle>,
    imported_pools: Vec<String>,
    key_drive: Option<String>,
    root: Option<Mounted>,
}

impl BootContext {
    pub fn new(params: BootParams, manifest: BootManifest) -> Self {
        let retry = params.apply_retry(&manifest.retry);
        Self {
            params,
            manifest,
            retry,
            loaded_modules: Vec::new(),
            unlocked: Vec::new(),
            imported_pools: Vec::new(),
            key_drive: None,
            root: None,
        }
    }

    pub fn params(&self) -> &BootParams {
        &self.params
    }

    pub fn manifest(&self) -> &BootManifest {
        &self.manifest
    }

    /// Effective retry policy: manifest defaults with command-line overrides.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn record_module(&mut self, name: &str) {
        self.loaded_modules.push(name.to_string());
    }

    pub fn record_unlocked(&mut self, handle: UnlockedHandle) {
        self.unlocked.push(handle);
    }

    pub fn record_pools(&mut self, pools: &[String]) {
        for pool in pools {
            if !self.imported_pools.contains(pool) {
                self.imported_pools.push(pool.clone());
            }
        }
    }

    pub fn record_key_drive(&mut self, device: &str) {
        self.key_drive.get_or_insert_with(|| device.to_string());
    }

    /// Device mounted at the key mount point, if any.
    pub fn key_drive(&self) -> Option<&str> {
        self.key_drive.as_deref()
    }

    /// Record the mounted root. Only the first call has an effect.
    pub fn set_root(&mut self, mounted: Mounted) -> bool {
        if let Some(ref existing) = self.root {
            tracing::warn!(
                existing = %existing.dataset,
                ignored = %mounted.dataset,
                "root already recorded"
            );
            return false;
        }
        self.record_pools(&mounted.pools);
        self.root = Some(mounted);
        true
    }

    pub fn loaded_modules(&self) -> &[String] {
        &self.loaded_modules
    }

    pub fn unlocked(&self) -> &[UnlockedHandle] {
        &self.unlocked
    }

    pub fn imported_pools(&self) -> &[String] {
        &self.imported_pools
    }

    pub fn root(&self) -> Option<&Mounted> {
        self.root.as_ref()
    }

    pub fn switch_root_target(&self) -> Option<&Path> {
        self.root.as_ref().map(|m| m.target.as_path())
    }

    /// Real init inside the mounted root, as seen from the initramfs.
    pub fn init_in_root(&self) -> Option<PathBuf> {
        let init = self.params.init_path();
        let relative = init.strip_prefix("/").unwrap_or(&init).to_path_buf();
        self.switch_root_target().map(|root| root.join(relative))
    }

    /// `zpool import` takes either a device directory or a cachefile, never
    /// both. `by=` and `refresh` ask for a scan, so they drop the cachefile.
    pub fn import_request(&self) -> PoolImportRequest {
        let scan_dir = self.params.scan_dir();
        let cachefile = if self.params.refresh || scan_dir.is_some() {
            None
        } else {
            self.params
                .cachefile
                .clone()
                .or_else(|| self.manifest.cachefile.clone())
        };
        PoolImportRequest {
            pool: self
                .params
                .pool_name()
                .map_or(PoolSelector::All, PoolSelector::Named),
            cachefile,
            scan_dir,
        }
    }

    /// `enc_type=`, else a keyfile when one is available, else a prompt.
    pub fn unlock_method(&self) -> UnlockMethod {
        match self.params.enc_type {
            Some(method) => method,
            None if self.params.enc_key.is_some() || self.manifest.embedded_keyfile.is_some() => {
                UnlockMethod::Keyfile
            }
            None => UnlockMethod::Passphrase,
        }
    }

    /// Where the keyfile is read from. With `enc_key_drive=` the path is
    /// relative to the mounted key drive.
    pub fn key_path(&self) -> PathBuf {
        let key = self
            .params
            .enc_key
            .clone()
            .or_else(|| self.manifest.embedded_keyfile.clone())
            .unwrap_or_else(|| PathBuf::from(KEYFILE_PATH));

        if self.params.enc_key_drive.is_some() {
            let relative = key.strip_prefix("/").unwrap_or(&key);
            Path::new(KEY_MOUNT).join(relative)
        } else {
            key
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{CACHEFILE_PATH, NEW_ROOT};

    fn context(cmdline: &str) -> BootContext {
        let mut manifest = BootManifest::new("6.6.30");
        manifest.cachefile = Some(PathBuf::from(CACHEFILE_PATH));
        BootContext::new(BootParams::parse(cmdline), manifest)
    }

    #[test]
    fn test_import_request_from_params() {
        let ctx = context("root=tank/ROOT/gentoo by=uuid");
        let request = ctx.import_request();
        assert_eq!(request.pool, PoolSelector::Named("tank".into()));
        assert_eq!(request.scan_dir, Some(PathBuf::from("/dev/disk/by-uuid")));
        assert_eq!(request.cachefile, None);

        let cached = context("root=tank/ROOT/gentoo").import_request();
        assert_eq!(cached.cachefile, Some(PathBuf::from(CACHEFILE_PATH)));
        assert_eq!(cached.scan_dir, None);

        let refreshed = context("root=zfs refresh").import_request();
        assert_eq!(refreshed.pool, PoolSelector::All);
        assert_eq!(refreshed.cachefile, None);
    }

    #[test]
    fn test_unlock_method_defaults() {
        assert_eq!(context("enc_root=/dev/sda2").unlock_method(), UnlockMethod::Passphrase);
        assert_eq!(
            context("enc_root=/dev/sda2 enc_key=/root.key").unlock_method(),
            UnlockMethod::Keyfile
        );
        assert_eq!(
            context("enc_root=/dev/sda2 enc_type=key_gpg").unlock_method(),
            UnlockMethod::GpgKeyfile
        );
    }

    #[test]
    fn test_key_path_on_key_drive() {
        let ctx = context("enc_key=/keys/root.gpg enc_key_drive=/dev/sdc1");
        assert_eq!(ctx.key_path(), PathBuf::from("/mnt/key/keys/root.gpg"));
        assert_eq!(context("").key_path(), PathBuf::from(KEYFILE_PATH));
    }

    #[test]
    fn test_root_is_set_once() {
        let mut ctx = context("init=/lib/systemd/systemd");
        let first = Mounted {
            pools: vec!["tank".into()],
            dataset: "tank/root".into(),
            target: PathBuf::from(NEW_ROOT),
        };
        assert!(ctx.set_root(first.clone()));
        assert!(!ctx.set_root(Mounted {
            dataset: "tank/other".into(),
            ..first
        }));
        assert_eq!(ctx.root().unwrap().dataset, "tank/root");
        assert_eq!(ctx.imported_pools().to_vec(), vec!["tank"]);
        assert_eq!(
            ctx.init_in_root(),
            Some(PathBuf::from("/mnt/root/lib/systemd/systemd"))
        );
    }
}
