//! Scripted [`BootSystem`] for tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BootError, BootResult};
use crate::manifest::ModuleLoad;

use super::mount::{PoolImportRequest, PoolSelector};
use super::system::BootSystem;

#[derive(Debug, Default)]
pub struct FakeSystem {
    /// Secret accepted by every LUKS device and ZFS key.
    pub secret: Vec<u8>,
    /// GPG passphrase and the key it decrypts to.
    pub gpg: Option<(String, Vec<u8>)>,
    /// Answers given to prompts, in order.
    pub answers: VecDeque<String>,
    pub prompts: u32,
    pub files: BTreeMap<PathBuf, Vec<u8>>,
    pub executables: BTreeSet<PathBuf>,
    pub pools_on_disk: Vec<String>,
    pub imported: Vec<String>,
    /// Imports that fail before devices "appear".
    pub import_failures: u32,
    pub import_calls: u32,
    pub bootfs: BTreeMap<String, String>,
    pub datasets: BTreeSet<String>,
    /// dataset -> encryption root with an unloaded key
    pub locked: BTreeMap<String, String>,
    pub settle_failures: u32,
    pub settle_calls: u32,
    pub fail_mount: bool,

    pub modules: Vec<String>,
    pub opened: Vec<String>,
    pub keys_loaded: Vec<String>,
    pub keymaps: Vec<PathBuf>,
    pub key_drives: Vec<String>,
    pub mounted: Vec<(String, PathBuf, Option<String>)>,
    pub slept: Vec<Duration>,
    pub switched: Option<(PathBuf, PathBuf, Vec<String>)>,
    pub rescue_sessions: u32,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secret = secret.as_bytes().to_vec();
        self
    }

    pub fn with_gpg(mut self, passphrase: &str, key: &[u8]) -> Self {
        self.gpg = Some((passphrase.to_string(), key.to_vec()));
        self
    }

    pub fn with_file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.insert(PathBuf::from(path), content.to_vec());
        self
    }

    pub fn with_executable(mut self, path: &str) -> Self {
        self.files.insert(PathBuf::from(path), Vec::new());
        self.executables.insert(PathBuf::from(path));
        self
    }

    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pools_on_disk.push(pool.to_string());
        self
    }

    pub fn with_dataset(mut self, dataset: &str) -> Self {
        self.datasets.insert(dataset.to_string());
        self
    }

    pub fn with_bootfs(mut self, pool: &str, dataset: &str) -> Self {
        self.bootfs.insert(pool.to_string(), dataset.to_string());
        self
    }

    pub fn answers<I, S>(&mut self, answers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.answers.extend(answers.into_iter().map(Into::into));
    }
}

impl BootSystem for FakeSystem {
    fn mount_pseudo_filesystems(&mut self) -> BootResult<()> {
        Ok(())
    }

    fn load_module(&mut self, module: &ModuleLoad) -> BootResult<()> {
        self.modules.push(module.name.clone());
        Ok(())
    }

    fn start_udev(&mut self) -> BootResult<()> {
        Ok(())
    }

    fn settle(&mut self, _timeout: Duration) -> BootResult<bool> {
        self.settle_calls += 1;
        if self.settle_failures > 0 {
            self.settle_failures -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn load_keymap(&mut self, path: &Path) -> BootResult<()> {
        self.keymaps.push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn is_executable(&self, path: &Path) -> bool {
        self.executables.contains(path)
    }

    fn read_key(&mut self, path: &Path) -> BootResult<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| BootError::KeyfileMissing(path.to_path_buf()))
    }

    fn mount_key_drive(&mut self, device: &str, _target: &Path) -> BootResult<()> {
        self.key_drives.push(device.to_string());
        Ok(())
    }

    fn prompt_secret(&mut self, _prompt: &str) -> BootResult<String> {
        self.prompts += 1;
        self.answers
            .pop_front()
            .ok_or_else(|| BootError::command("prompt", "no scripted answer left"))
    }

    fn gpg_decrypt(&mut self, _keyfile: &Path, passphrase: &str) -> BootResult<Option<Vec<u8>>> {
        Ok(match self.gpg {
            Some((ref expected, ref key)) if expected == passphrase => Some(key.clone()),
            _ => None,
        })
    }

    fn luks_open(
        &mut self,
        device: &str,
        mapping: &str,
        key: &[u8],
        _header: Option<&Path>,
    ) -> BootResult<bool> {
        if key == self.secret.as_slice() {
            self.opened.push(format!("{} -> {}", device, mapping));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn imported_pools(&mut self) -> BootResult<Vec<String>> {
        Ok(self.imported.clone())
    }

    fn import_pool(&mut self, request: &PoolImportRequest) -> BootResult<bool> {
        self.import_calls += 1;
        // zpool: "-c is incompatible with -d"
        if request.scan_dir.is_some() && request.cachefile.is_some() {
            return Ok(false);
        }
        if self.import_failures > 0 {
            self.import_failures -= 1;
            return Ok(false);
        }
        let found: Vec<String> = match request.pool {
            PoolSelector::Named(ref name) => self
                .pools_on_disk
                .iter()
                .filter(|p| *p == name)
                .cloned()
                .collect(),
            PoolSelector::All => self.pools_on_disk.clone(),
        };
        for pool in &found {
            if !self.imported.contains(pool) {
                self.imported.push(pool.clone());
            }
        }
        Ok(!found.is_empty())
    }

    fn bootfs(&mut self, pool: &str) -> BootResult<Option<String>> {
        Ok(self.bootfs.get(pool).cloned())
    }

    fn dataset_exists(&mut self, dataset: &str) -> BootResult<bool> {
        Ok(self.datasets.contains(dataset))
    }

    fn locked_encryption_root(&mut self, dataset: &str) -> BootResult<Option<String>> {
        Ok(self.locked.get(dataset).cloned())
    }

    fn zfs_load_key(&mut self, encryption_root: &str, key: &[u8]) -> BootResult<bool> {
        if key == self.secret.as_slice() {
            self.keys_loaded.push(encryption_root.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn mount_dataset(
        &mut self,
        dataset: &str,
        target: &Path,
        options: Option<&str>,
    ) -> BootResult<()> {
        if self.fail_mount {
            return Err(BootError::MountFailed {
                target: target.display().to_string(),
                reason: "scripted failure".into(),
            });
        }
        self.mounted
            .push((dataset.to_string(), target.to_path_buf(), options.map(str::to_string)));
        Ok(())
    }

    fn sleep(&mut self, duration: Duration) {
        self.slept.push(duration);
    }

    fn switch_root(&mut self, new_root: &Path, init: &Path, args: &[String]) -> BootResult<()> {
        self.switched = Some((new_root.to_path_buf(), init.to_path_buf(), args.to_vec()));
        Ok(())
    }

    fn rescue_shell(&mut self) -> BootResult<()> {
        self.rescue_sessions += 1;
        Ok(())
    }
}
