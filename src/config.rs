//! Build configuration.
//!
//! Three layers feed a build, highest precedence first:
//! 1. Command-line flags
//! 2. Environment variables (a `.env` file is loaded into the environment first)
//! 3. `settings.json` (file lists and host layout)
//!
//! Everything is folded into an immutable [`BuildConfig`] once per invocation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BuildError, BuildResult};
use crate::manifest::RetryPolicy;

/// Default location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/zboot/settings.json";

/// Prefix of the produced image name (`initrd-<kernel>`).
pub const DEFAULT_IMAGE_PREFIX: &str = "initrd-";

/// Optional capabilities of the produced image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// ZFS tools and the `zfs` kernel module.
    Zfs,
    /// LUKS/GPG encryption helpers.
    Luks,
    /// Ship a console keymap.
    Keymap,
    /// Nothing beyond the base image.
    Basic,
}

impl FromStr for Feature {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zfs" => Ok(Feature::Zfs),
            "luks" | "encryption" => Ok(Feature::Luks),
            "keymap" => Ok(Feature::Keymap),
            "basic" => Ok(Feature::Basic),
            other => Err(BuildError::Configuration(format!(
                "unknown feature '{}' (available: zfs, luks, keymap, basic)",
                other
            ))),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::Zfs => "zfs",
            Feature::Luks => "luks",
            Feature::Keymap => "keymap",
            Feature::Basic => "basic",
        };
        f.write_str(name)
    }
}

/// Parse a comma separated feature list (`zfs,luks`).
pub fn parse_features(list: &str) -> BuildResult<BTreeSet<Feature>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Feature::from_str)
        .collect()
}

/// Compression applied to the cpio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip { level: u32 },
    Zstd { level: i32 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip { level: 9 }
    }
}

impl FromStr for Compression {
    type Err = BuildError;

    /// Accepts `none`, `gzip`, `gzip:6`, `zstd`, `zstd:19`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, level) = match s.split_once(':') {
            Some((scheme, level)) => (scheme, Some(level)),
            None => (s, None),
        };
        let bad_level = |l: &str| {
            BuildError::Configuration(format!("invalid compression level '{}' for {}", l, scheme))
        };
        match scheme.trim().to_ascii_lowercase().as_str() {
            "none" | "cat" => Ok(Compression::None),
            "gzip" | "gz" => {
                let level = match level {
                    Some(l) => l.parse::<u32>().map_err(|_| bad_level(l))?,
                    None => 9,
                };
                if level > 9 {
                    return Err(bad_level(&level.to_string()));
                }
                Ok(Compression::Gzip { level })
            }
            "zstd" | "zst" => {
                let level = match level {
                    Some(l) => l.parse::<i32>().map_err(|_| bad_level(l))?,
                    None => 19,
                };
                if !(1..=22).contains(&level) {
                    return Err(bad_level(&level.to_string()));
                }
                Ok(Compression::Zstd { level })
            }
            other => Err(BuildError::Configuration(format!(
                "unknown compression scheme '{}' (available: none, gzip, zstd)",
                other
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip { level } => write!(f, "gzip:{}", level),
            Compression::Zstd { level } => write!(f, "zstd:{}", level),
        }
    }
}

/// Where the console keymap comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeymapSource {
    /// Dump the build host's active keymap with `dumpkeys`.
    Dump,
    /// Ship an existing keymap file.
    File(PathBuf),
}

// =============================================================================
// settings.json
// =============================================================================

/// Contents of `settings.json`. Every section has defaults so the file is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub base: BaseSettings,
    pub modules: ModuleSettings,
    pub zfs: ZfsSettings,
    pub luks: LuksSettings,
    pub firmware: FirmwareSettings,
    pub system_directory: SystemDirectory,
    pub modules_directory: PathBuf,
    pub firmware_directory: PathBuf,
    pub image_prefix: String,
    pub udev_config_directory: PathBuf,
    pub udev_lib_directory: PathBuf,
    pub modprobe_directory: PathBuf,
    pub preliminary_build_binaries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BaseSettings {
    pub files: Vec<PathBuf>,
    pub kmod_links: Vec<String>,
    pub udev_path: PathBuf,
}

impl Default for BaseSettings {
    fn default() -> Self {
        Self {
            files: [
                "/bin/busybox",
                "/bin/bash",
                "/bin/kmod",
                "/bin/udevadm",
                "/lib/systemd/systemd-udevd",
                "/sbin/blkid",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            kmod_links: ["depmod", "insmod", "lsmod", "modinfo", "modprobe", "rmmod"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            udev_path: PathBuf::from("/lib/systemd/systemd-udevd"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModuleSettings {
    /// Kernel modules to ship regardless of features (e.g. `nvme`, `dm-crypt`).
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZfsSettings {
    pub files: Vec<PathBuf>,
    /// Copied when present; never fail the build.
    pub optional_files: Vec<PathBuf>,
}

impl Default for ZfsSettings {
    fn default() -> Self {
        Self {
            files: ["/sbin/zfs", "/sbin/zpool", "/sbin/mount.zfs"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            optional_files: [
                "/sbin/zdb",
                "/sbin/fsck.zfs",
                "/sbin/zgenhostid",
                "/etc/hostid",
                "/etc/zfs/zpool.cache",
                "/etc/zfs/vdev_id.conf",
                "/lib/udev/zvol_id",
                "/lib/udev/vdev_id",
                "/lib/udev/rules.d/60-zvol.rules",
                "/lib/udev/rules.d/69-vdev.rules",
                "/lib/udev/rules.d/90-zfs.rules",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LuksSettings {
    pub files: Vec<PathBuf>,
    pub use_keyfile: bool,
    pub keyfile_path: Option<PathBuf>,
    pub use_detached_header: bool,
    pub detached_header_path: Option<PathBuf>,
}

impl Default for LuksSettings {
    fn default() -> Self {
        Self {
            // dmsetup releases udev cookies; without it cryptsetup hangs
            // at "waiting for zero". gpg hands passphrases to gpg-agent.
            files: [
                "/sbin/cryptsetup",
                "/sbin/dmsetup",
                "/usr/bin/gpg",
                "/usr/bin/gpg-agent",
            ]
            .iter()
                .map(PathBuf::from)
                .collect(),
            use_keyfile: false,
            keyfile_path: None,
            use_detached_header: false,
            detached_header_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FirmwareSettings {
    #[serde(rename = "use")]
    pub enabled: bool,
    pub copy_all: bool,
    pub files: Vec<PathBuf>,
    pub directories: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemDirectory {
    pub bin: PathBuf,
    pub sbin: PathBuf,
    pub lib: PathBuf,
    pub lib64: PathBuf,
    pub etc: PathBuf,
}

impl Default for SystemDirectory {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("/bin"),
            sbin: PathBuf::from("/sbin"),
            lib: PathBuf::from("/lib"),
            lib64: PathBuf::from("/lib64"),
            etc: PathBuf::from("/etc"),
        }
    }
}

impl Settings {
    /// Built-in defaults with the host directory layout filled in.
    pub fn defaults() -> Self {
        Self {
            modules_directory: PathBuf::from("/lib/modules"),
            firmware_directory: PathBuf::from("/lib/firmware"),
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            udev_config_directory: PathBuf::from("/etc/udev"),
            udev_lib_directory: PathBuf::from("/lib/udev"),
            modprobe_directory: PathBuf::from("/etc/modprobe.d"),
            ..Default::default()
        }
    }

    /// Load settings from a JSON file.
    ///
    /// Missing fields fall back to defaults. A missing file is an error here;
    /// use [`Settings::load_or_default`] when the file is optional.
    pub fn load(path: &Path) -> BuildResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BuildError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| BuildError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Parse settings JSON, filling unset directories with defaults.
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        let mut settings: Settings = serde_json::from_str(content)?;
        settings.fill_defaults();
        Ok(settings)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: &Path) -> BuildResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "settings file absent, using defaults");
            Ok(Self::defaults())
        }
    }

    fn fill_defaults(&mut self) {
        let defaults = Self::defaults();
        let empty = |p: &PathBuf| p.as_os_str().is_empty();
        if empty(&self.modules_directory) {
            self.modules_directory = defaults.modules_directory;
        }
        if empty(&self.firmware_directory) {
            self.firmware_directory = defaults.firmware_directory;
        }
        if self.image_prefix.is_empty() {
            self.image_prefix = defaults.image_prefix;
        }
        if empty(&self.udev_config_directory) {
            self.udev_config_directory = defaults.udev_config_directory;
        }
        if empty(&self.udev_lib_directory) {
            self.udev_lib_directory = defaults.udev_lib_directory;
        }
        if empty(&self.modprobe_directory) {
            self.modprobe_directory = defaults.modprobe_directory;
        }
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Values read from the process environment.
///
/// Call `dotenvy::dotenv()` before [`EnvOverrides::from_env`] so a `.env`
/// file participates; real environment variables win over `.env` entries.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub settings: Option<PathBuf>,
    pub host_root: Option<PathBuf>,
    pub init_binary: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub compression: Option<String>,
    pub source_date_epoch: Option<u32>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup function (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            settings: get("ZBOOT_SETTINGS").map(PathBuf::from),
            host_root: get("ZBOOT_HOST_ROOT").map(PathBuf::from),
            init_binary: get("ZBOOT_INIT_BINARY").map(PathBuf::from),
            output_dir: get("ZBOOT_OUTPUT_DIR").map(PathBuf::from),
            compression: get("ZBOOT_COMPRESSION"),
            source_date_epoch: get("SOURCE_DATE_EPOCH").and_then(|v| v.trim().parse().ok()),
        }
    }
}

// =============================================================================
// BuildConfig
// =============================================================================

/// Immutable configuration of one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    kernel_version: String,
    compression: Compression,
    features: BTreeSet<Feature>,
    modules: Vec<String>,
    output: PathBuf,
    host_root: PathBuf,
    init_binary: PathBuf,
    keymap: Option<KeymapSource>,
    retry: RetryPolicy,
    mtime: u32,
    settings: Settings,
}

impl BuildConfig {
    pub fn builder(kernel_version: impl Into<String>) -> BuildConfigBuilder {
        BuildConfigBuilder::new(kernel_version)
    }

    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn features(&self) -> &BTreeSet<Feature> {
        &self.features
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Requested kernel modules, in request order, without duplicates.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn init_binary(&self) -> &Path {
        &self.init_binary
    }

    pub fn keymap(&self) -> Option<&KeymapSource> {
        self.keymap.as_ref()
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Modification time stamped on every archive entry.
    pub fn mtime(&self) -> u32 {
        self.mtime
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Host path of a file given as an absolute path on the build host.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        self.host_root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Host directory holding this kernel's modules.
    pub fn modules_dir(&self) -> PathBuf {
        self.host_path(&self.settings.modules_directory)
            .join(&self.kernel_version)
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  Kernel: {}", self.kernel_version);
        let features: Vec<String> = self.features.iter().map(|f| f.to_string()).collect();
        println!("  Features: {}", features.join(","));
        println!("  Modules: {}", self.modules.join(" "));
        println!("  Compression: {}", self.compression);
        println!("  Output: {}", self.output.display());
        println!("  Host root: {}", self.host_root.display());
        println!("  Init binary: {}", self.init_binary.display());
        match &self.keymap {
            Some(KeymapSource::Dump) => println!("  Keymap: dumped from host"),
            Some(KeymapSource::File(p)) => println!("  Keymap: {}", p.display()),
            None => println!("  Keymap: none"),
        }
        println!("  Archive mtime: {}", self.mtime);
    }
}

/// Collects inputs for a [`BuildConfig`] and validates them once.
#[derive(Debug, Clone)]
pub struct BuildConfigBuilder {
    kernel_version: String,
    compression: Option<Compression>,
    features: BTreeSet<Feature>,
    extra_modules: Vec<String>,
    output: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    host_root: Option<PathBuf>,
    init_binary: Option<PathBuf>,
    keymap_file: Option<PathBuf>,
    retry: RetryPolicy,
    mtime: u32,
    settings: Settings,
}

impl BuildConfigBuilder {
    pub fn new(kernel_version: impl Into<String>) -> Self {
        Self {
            kernel_version: kernel_version.into(),
            compression: None,
            features: BTreeSet::new(),
            extra_modules: Vec::new(),
            output: None,
            output_dir: None,
            host_root: None,
            init_binary: None,
            keymap_file: None,
            retry: RetryPolicy::default(),
            mtime: 0,
            settings: Settings::defaults(),
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.features.insert(feature);
        self
    }

    pub fn features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features.extend(features);
        self
    }

    pub fn module(mut self, name: impl Into<String>) -> Self {
        self.extra_modules.push(name.into());
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn host_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.host_root = Some(root.into());
        self
    }

    pub fn init_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.init_binary = Some(path.into());
        self
    }

    pub fn keymap_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.keymap_file = Some(path.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn mtime(mut self, mtime: u32) -> Self {
        self.mtime = mtime;
        self
    }

    /// Apply environment overrides that were not already set explicitly.
    pub fn env(mut self, env: &EnvOverrides) -> BuildResult<Self> {
        if self.host_root.is_none() {
            self.host_root = env.host_root.clone();
        }
        if self.init_binary.is_none() {
            self.init_binary = env.init_binary.clone();
        }
        if self.output_dir.is_none() {
            self.output_dir = env.output_dir.clone();
        }
        if self.compression.is_none() {
            if let Some(c) = &env.compression {
                self.compression = Some(c.parse()?);
            }
        }
        if self.mtime == 0 {
            self.mtime = env.source_date_epoch.unwrap_or(0);
        }
        Ok(self)
    }

    pub fn build(self) -> BuildResult<BuildConfig> {
        let kernel_version = self.kernel_version.trim().to_string();
        if kernel_version.is_empty() {
            return Err(BuildError::Configuration("kernel version is empty".into()));
        }
        if kernel_version.contains('/') {
            return Err(BuildError::Configuration(format!(
                "kernel version '{}' contains a path separator",
                kernel_version
            )));
        }

        let mut features = self.features;
        if features.is_empty() {
            features.insert(Feature::Zfs);
        }

        // Request order: settings, feature-implied, command line.
        let mut modules: Vec<String> = Vec::new();
        let implied = features
            .contains(&Feature::Zfs)
            .then(|| "zfs".to_string());
        for name in self
            .settings
            .modules
            .files
            .iter()
            .cloned()
            .chain(implied)
            .chain(self.extra_modules)
        {
            let name = name.trim().to_string();
            if !name.is_empty() && !modules.contains(&name) {
                modules.push(name);
            }
        }

        let output = match (self.output, self.output_dir) {
            (Some(path), _) => path,
            (None, dir) => dir
                .unwrap_or_else(|| PathBuf::from("."))
                .join(format!("{}{}", self.settings.image_prefix, kernel_version)),
        };

        let keymap = if let Some(file) = self.keymap_file {
            features.insert(Feature::Keymap);
            Some(KeymapSource::File(file))
        } else if features.contains(&Feature::Keymap) {
            Some(KeymapSource::Dump)
        } else {
            None
        };

        if features.contains(&Feature::Luks) {
            let luks = &self.settings.luks;
            if luks.use_keyfile && luks.keyfile_path.is_none() {
                return Err(BuildError::Configuration(
                    "luks.useKeyfile is set but luks.keyfilePath is empty".into(),
                ));
            }
            if luks.use_detached_header && luks.detached_header_path.is_none() {
                return Err(BuildError::Configuration(
                    "luks.useDetachedHeader is set but luks.detachedHeaderPath is empty".into(),
                ));
            }
        }

        self.retry.validate()?;

        Ok(BuildConfig {
            kernel_version,
            compression: self.compression.unwrap_or_default(),
            features,
            modules,
            output,
            host_root: self.host_root.unwrap_or_else(|| PathBuf::from("/")),
            init_binary: self.init_binary.unwrap_or_else(default_init_binary),
            keymap,
            retry: self.retry,
            mtime: self.mtime,
            settings: self.settings,
        })
    }
}

/// `zboot-init` installed next to the running `zboot` binary.
fn default_init_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("zboot-init")))
        .unwrap_or_else(|| PathBuf::from("/usr/libexec/zboot/zboot-init"))
}

/// Default settings path: `$XDG_CONFIG_HOME/zboot/settings.json` if present,
/// otherwise the system-wide location.
pub fn default_settings_path() -> PathBuf {
    if let Some(user) = dirs::config_dir().map(|d| d.join("zboot/settings.json")) {
        if user.exists() {
            return user;
        }
    }
    PathBuf::from(DEFAULT_SETTINGS_PATH)
}
