//! Data handed from the image builder to the init running inside the image.
//!
//! The builder serializes a [`BootManifest`] to [`MANIFEST_PATH`]; `zboot-init`
//! reads it back at boot. Plain serde structures, no shared runtime objects.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Feature;
use crate::error::{BuildError, BuildResult};

/// Location of the manifest inside the image.
pub const MANIFEST_PATH: &str = "/etc/zboot/boot.json";

/// Location of the version stamp inside the image.
pub const VERSION_PATH: &str = "/etc/zboot/version";

/// Fixed paths inside the image shared by the builder and the init.
pub const KEYFILE_PATH: &str = "/etc/keyfile";
pub const HEADER_PATH: &str = "/etc/header";
pub const KEYMAP_PATH: &str = "/etc/keymap";
pub const CACHEFILE_PATH: &str = "/etc/zfs/zpool.cache";
pub const UDEVD_PATH: &str = "/sbin/udevd";
/// Where the root dataset is mounted before switch-root.
pub const NEW_ROOT: &str = "/mnt/root";
/// Where `enc_key_drive` is mounted read-only.
pub const KEY_MOUNT: &str = "/mnt/key";

/// Retry and timeout tuning for the boot stages.
///
/// These are operational knobs, not contracts: defaults are written into the
/// manifest at build time and can be overridden on the kernel command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// How long device settling may take before it is a timing failure.
    pub settle_timeout_ms: u64,
    /// Interval between settle polls.
    pub settle_poll_ms: u64,
    /// Pool import attempts before giving up.
    pub import_attempts: u32,
    /// Pause between pool import attempts.
    pub import_delay_ms: u64,
    /// Unlock attempts per encrypted device.
    pub unlock_attempts: u32,
    /// Extra attempts the sequencer grants a stage that failed transiently.
    pub stage_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            settle_timeout_ms: 10_000,
            settle_poll_ms: 250,
            import_attempts: 5,
            import_delay_ms: 1_000,
            unlock_attempts: 3,
            stage_retries: 1,
        }
    }
}

impl RetryPolicy {
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn settle_poll(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms)
    }

    pub fn import_delay(&self) -> Duration {
        Duration::from_millis(self.import_delay_ms)
    }

    pub fn validate(&self) -> BuildResult<()> {
        if self.import_attempts == 0 {
            return Err(BuildError::Configuration(
                "import_attempts must be at least 1".into(),
            ));
        }
        if self.unlock_attempts == 0 {
            return Err(BuildError::Configuration(
                "unlock_attempts must be at least 1".into(),
            ));
        }
        if self.settle_poll_ms == 0 {
            return Err(BuildError::Configuration(
                "settle_poll_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// A kernel module to insert at boot, with its path inside the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLoad {
    pub name: String,
    pub path: PathBuf,
}

/// Everything the init needs to know about how the image was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootManifest {
    /// zboot version that produced the image.
    pub version: String,
    pub kernel_version: String,
    pub features: Vec<Feature>,
    /// Modules in load order: dependencies before dependents.
    pub modules: Vec<ModuleLoad>,
    /// Keymap shipped in the image, if any.
    pub keymap: Option<PathBuf>,
    /// Plain keyfile embedded in the image, if any.
    pub embedded_keyfile: Option<PathBuf>,
    /// Detached LUKS header embedded in the image, if any.
    pub detached_header: Option<PathBuf>,
    /// Pool cache file shipped in the image, if any.
    pub cachefile: Option<PathBuf>,
    pub retry: RetryPolicy,
}

impl BootManifest {
    pub fn new(kernel_version: impl Into<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            kernel_version: kernel_version.into(),
            features: Vec::new(),
            modules: Vec::new(),
            keymap: None,
            embedded_keyfile: None,
            detached_header: None,
            cachefile: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn to_json(&self) -> BuildResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| BuildError::Serialization {
            path: PathBuf::from(MANIFEST_PATH),
            reason: e.to_string(),
        })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Read the manifest at boot. A missing file yields a manifest with
    /// defaults so the rescue path still works on a hand-assembled image.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Self::from_json(&bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new("unknown")),
            Err(e) => Err(e),
        }
    }
}
