//! Decryption of LUKS devices and ZFS native encryption roots.
//!
//! One [`UnlockCoordinator`] serves every encrypted target of a boot. A
//! secret that opened one target is tried first on the next, so a machine
//! with several devices sharing a passphrase prompts only once.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BootError, BootResult};

use super::system::BootSystem;

/// How the key for an encrypted target is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMethod {
    /// Prompt the operator for the passphrase.
    Passphrase,
    /// Plain keyfile, embedded in the image or on a key drive.
    Keyfile,
    /// GPG-encrypted keyfile; the operator supplies the GPG passphrase.
    GpgKeyfile,
}

impl FromStr for UnlockMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" | "passphrase" => Ok(UnlockMethod::Passphrase),
            "key" => Ok(UnlockMethod::Keyfile),
            "key_gpg" => Ok(UnlockMethod::GpgKeyfile),
            other => Err(format!("unknown unlock method '{}'", other)),
        }
    }
}

impl fmt::Display for UnlockMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnlockMethod::Passphrase => "pass",
            UnlockMethod::Keyfile => "key",
            UnlockMethod::GpgKeyfile => "key_gpg",
        })
    }
}

/// Something that needs a key before the root can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockTarget {
    Luks {
        device: String,
        mapping: String,
        header: Option<PathBuf>,
    },
    ZfsKey {
        encryption_root: String,
    },
}

impl UnlockTarget {
    /// LUKS target for the `index`th `enc_root` device.
    pub fn luks(device: impl Into<String>, index: usize, header: Option<PathBuf>) -> Self {
        UnlockTarget::Luks {
            device: device.into(),
            mapping: format!("vault_{}", index),
            header,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            UnlockTarget::Luks { device, .. } => device,
            UnlockTarget::ZfsKey { encryption_root } => encryption_root,
        }
    }

    /// Block device that appears once the target is open.
    pub fn mapped_path(&self) -> Option<PathBuf> {
        match self {
            UnlockTarget::Luks { mapping, .. } => {
                Some(Path::new("/dev/mapper").join(mapping))
            }
            UnlockTarget::ZfsKey { .. } => None,
        }
    }
}

/// One decryption attempt, as recorded by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockAttempt {
    pub device: String,
    pub method: UnlockMethod,
    /// 1-based; never exceeds `max_attempts`.
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockedHandle {
    pub device: String,
    pub mapped: Option<PathBuf>,
    /// Attempts consumed; zero when a secret from an earlier target was reused.
    pub attempts: u32,
}

pub struct UnlockCoordinator<'a, S: BootSystem> {
    system: &'a mut S,
    method: UnlockMethod,
    key_path: PathBuf,
    max_attempts: u32,
    cached: Option<Vec<u8>>,
    history: Vec<UnlockAttempt>,
}

impl<'a, S: BootSystem> UnlockCoordinator<'a, S> {
    pub fn new(
        system: &'a mut S,
        method: UnlockMethod,
        key_path: impl Into<PathBuf>,
        max_attempts: u32,
    ) -> Self {
        Self {
            system,
            method,
            key_path: key_path.into(),
            max_attempts: max_attempts.max(1),
            cached: None,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[UnlockAttempt] {
        &self.history
    }

    pub fn unlock(&mut self, target: &UnlockTarget) -> BootResult<UnlockedHandle> {
        let label = target.label().to_string();

        if let Some(secret) = self.cached.clone() {
            if self.try_secret(target, &secret)? {
                tracing::info!(device = %label, "unlocked with the previous secret");
                return Ok(self.handle(target, 0));
            }
        }

        match self.method {
            UnlockMethod::Keyfile => self.unlock_with_keyfile(target),
            UnlockMethod::GpgKeyfile => self.unlock_with_gpg(target),
            UnlockMethod::Passphrase => self.unlock_with_passphrase(target),
        }
    }

    fn unlock_with_keyfile(&mut self, target: &UnlockTarget) -> BootResult<UnlockedHandle> {
        let key = self.system.read_key(&self.key_path)?;
        self.record(target, 1);
        if self.try_secret(target, &key)? {
            self.cached = Some(key);
            return Ok(self.handle(target, 1));
        }
        // The same key will not work on a second try.
        Err(BootError::AuthExhausted {
            device: target.label().to_string(),
            attempts: 1,
        })
    }

    fn unlock_with_gpg(&mut self, target: &UnlockTarget) -> BootResult<UnlockedHandle> {
        if !self.system.exists(&self.key_path) {
            return Err(BootError::KeyfileMissing(self.key_path.clone()));
        }

        for attempt in 1..=self.max_attempts {
            self.record(target, attempt);
            let prompt = format!(
                "GPG passphrase for {} ({}/{}): ",
                self.key_path.display(),
                attempt,
                self.max_attempts
            );
            let passphrase = self.system.prompt_secret(&prompt)?;

            let Some(key) = self.system.gpg_decrypt(&self.key_path, &passphrase)? else {
                tracing::warn!(device = target.label(), attempt, "wrong GPG passphrase");
                continue;
            };
            if self.try_secret(target, &key)? {
                self.cached = Some(key);
                return Ok(self.handle(target, attempt));
            }
            tracing::warn!(device = target.label(), attempt, "decrypted key was rejected");
        }

        Err(self.exhausted(target))
    }

    fn unlock_with_passphrase(&mut self, target: &UnlockTarget) -> BootResult<UnlockedHandle> {
        for attempt in 1..=self.max_attempts {
            self.record(target, attempt);
            let prompt = format!(
                "Passphrase for {} ({}/{}): ",
                target.label(),
                attempt,
                self.max_attempts
            );
            let passphrase = self.system.prompt_secret(&prompt)?;
            let secret = passphrase.into_bytes();
            if self.try_secret(target, &secret)? {
                self.cached = Some(secret);
                return Ok(self.handle(target, attempt));
            }
            tracing::warn!(device = target.label(), attempt, "wrong passphrase");
        }

        Err(self.exhausted(target))
    }

    fn try_secret(&mut self, target: &UnlockTarget, secret: &[u8]) -> BootResult<bool> {
        match target {
            UnlockTarget::Luks {
                device,
                mapping,
                header,
            } => self
                .system
                .luks_open(device, mapping, secret, header.as_deref()),
            UnlockTarget::ZfsKey { encryption_root } => {
                self.system.zfs_load_key(encryption_root, secret)
            }
        }
    }

    fn record(&mut self, target: &UnlockTarget, attempt: u32) {
        self.history.push(UnlockAttempt {
            device: target.label().to_string(),
            method: self.method,
            attempt,
            max_attempts: self.max_attempts,
        });
    }

    fn handle(&self, target: &UnlockTarget, attempts: u32) -> UnlockedHandle {
        UnlockedHandle {
            device: target.label().to_string(),
            mapped: target.mapped_path(),
            attempts,
        }
    }

    fn exhausted(&self, target: &UnlockTarget) -> BootError {
        BootError::AuthExhausted {
            device: target.label().to_string(),
            attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::fake::FakeSystem;
    use crate::manifest::KEYFILE_PATH;
    use proptest::prelude::*;

    fn sda2() -> UnlockTarget {
        UnlockTarget::luks("/dev/sda2", 0, None)
    }

    #[test]
    fn test_method_names() {
        assert_eq!("pass".parse(), Ok(UnlockMethod::Passphrase));
        assert_eq!("key".parse(), Ok(UnlockMethod::Keyfile));
        assert_eq!("key_gpg".parse(), Ok(UnlockMethod::GpgKeyfile));
        assert!("tpm".parse::<UnlockMethod>().is_err());
        assert_eq!(UnlockMethod::GpgKeyfile.to_string(), "key_gpg");
    }

    #[test]
    fn test_exhaustion_after_n_wrong_passphrases() {
        let mut system = FakeSystem::new().with_secret("right");
        system.answers(["a", "b", "c", "right"]);

        let mut coordinator =
            UnlockCoordinator::new(&mut system, UnlockMethod::Passphrase, KEYFILE_PATH, 3);
        let err = coordinator.unlock(&sda2()).unwrap_err();
        assert!(matches!(err, BootError::AuthExhausted { attempts: 3, .. }));
        assert_eq!(coordinator.history().len(), 3);
        assert!(coordinator.history().iter().all(|a| a.attempt <= 3));
        drop(coordinator);

        assert_eq!(system.prompts, 3);
        assert!(system.opened.is_empty());
    }

    proptest! {
        #[test]
        fn prop_success_on_attempt_k_stops_prompting(max in 1u32..6, k_offset in 0u32..6) {
            let k = 1 + k_offset % max;
            let mut system = FakeSystem::new().with_secret("right");
            let mut answers: Vec<String> = (1..k).map(|i| format!("wrong{}", i)).collect();
            answers.push("right".into());
            answers.push("never-asked".into());
            system.answers(answers);

            let mut coordinator =
                UnlockCoordinator::new(&mut system, UnlockMethod::Passphrase, KEYFILE_PATH, max);
            let handle = coordinator.unlock(&sda2()).unwrap();
            prop_assert_eq!(handle.attempts, k);
            prop_assert_eq!(handle.mapped, Some(PathBuf::from("/dev/mapper/vault_0")));
            drop(coordinator);
            prop_assert_eq!(system.prompts, k);
        }
    }

    #[test]
    fn test_missing_plain_keyfile_fails_without_retry() {
        let mut system = FakeSystem::new().with_secret("key");
        let mut coordinator =
            UnlockCoordinator::new(&mut system, UnlockMethod::Keyfile, KEYFILE_PATH, 5);
        let err = coordinator.unlock(&sda2()).unwrap_err();
        assert!(matches!(err, BootError::KeyfileMissing(_)));
        assert!(coordinator.history().is_empty());
        drop(coordinator);
        assert_eq!(system.prompts, 0);
    }

    #[test]
    fn test_plain_keyfile_opens_device() {
        let mut system = FakeSystem::new()
            .with_secret("key")
            .with_file(KEYFILE_PATH, b"key");
        let mut coordinator =
            UnlockCoordinator::new(&mut system, UnlockMethod::Keyfile, KEYFILE_PATH, 3);
        let handle = coordinator.unlock(&sda2()).unwrap();
        assert_eq!(handle.attempts, 1);
        drop(coordinator);
        assert_eq!(system.opened, vec!["/dev/sda2 -> vault_0".to_string()]);
    }

    #[test]
    fn test_gpg_wrong_passphrases_count_as_attempts() {
        let mut system = FakeSystem::new()
            .with_secret("decrypted")
            .with_gpg("gpg-pass", b"decrypted")
            .with_file("/mnt/key/key.gpg", b"ciphertext");
        system.answers(["nope", "gpg-pass"]);

        let mut coordinator =
            UnlockCoordinator::new(&mut system, UnlockMethod::GpgKeyfile, "/mnt/key/key.gpg", 3);
        let handle = coordinator.unlock(&sda2()).unwrap();
        assert_eq!(handle.attempts, 2);
    }

    #[test]
    fn test_secret_reused_for_next_device() {
        let mut system = FakeSystem::new().with_secret("right");
        system.answers(["right"]);

        let mut coordinator =
            UnlockCoordinator::new(&mut system, UnlockMethod::Passphrase, KEYFILE_PATH, 3);
        coordinator.unlock(&sda2()).unwrap();
        let second = coordinator
            .unlock(&UnlockTarget::luks("/dev/sdb2", 1, None))
            .unwrap();
        assert_eq!(second.attempts, 0);
        assert_eq!(second.mapped, Some(PathBuf::from("/dev/mapper/vault_1")));
        drop(coordinator);
        assert_eq!(system.prompts, 1);
    }

    #[test]
    fn test_zfs_native_key() {
        let mut system = FakeSystem::new().with_secret("zfs-pass");
        system.answers(["zfs-pass"]);
        let target = UnlockTarget::ZfsKey {
            encryption_root: "tank/secure".into(),
        };
        let mut coordinator =
            UnlockCoordinator::new(&mut system, UnlockMethod::Passphrase, KEYFILE_PATH, 3);
        let handle = coordinator.unlock(&target).unwrap();
        assert_eq!(handle.mapped, None);
        drop(coordinator);
        assert_eq!(system.keys_loaded, vec!["tank/secure".to_string()]);
    }
}
