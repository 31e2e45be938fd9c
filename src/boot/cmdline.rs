//! Kernel command-line parameters understood by the init.
//!
//! Unknown parameters are ignored; malformed values of known parameters are
//! logged and ignored so a typo never prevents boot.

use std::path::PathBuf;
use std::time::Duration;

use crate::manifest::{RetryPolicy, KEYMAP_PATH};

use super::unlock::UnlockMethod;

/// Default real init inside the root filesystem.
pub const DEFAULT_INIT: &str = "/sbin/init";

/// Accepted values of `by=`.
pub const SCAN_BY: &[&str] = &["id", "uuid", "label", "partuuid", "partlabel", "path"];

/// Parameters that gate optional boot stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Keymap,
    EncRoot,
    Recover,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootParams {
    /// Raw `root=` value.
    pub root: Option<String>,
    pub pool: Option<String>,
    /// `by=` scan hint, already validated.
    pub by: Option<String>,
    pub cachefile: Option<PathBuf>,
    pub refresh: bool,
    pub enc_root: Vec<String>,
    pub enc_type: Option<UnlockMethod>,
    pub enc_key: Option<PathBuf>,
    pub enc_key_drive: Option<String>,
    pub enc_tries: Option<u32>,
    pub keymap: Option<PathBuf>,
    pub options: Option<String>,
    pub recover: bool,
    pub single_user: bool,
    pub init: Option<PathBuf>,
    pub settle_timeout: Option<u64>,
    pub import_tries: Option<u32>,
    pub import_delay: Option<u64>,
}

/// Split a command line into words, honouring double quotes.
fn tokenize(cmdline: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in cmdline.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(param = key, value, "ignoring malformed value");
            None
        }
    }
}

impl BootParams {
    pub fn parse(cmdline: &str) -> Self {
        let mut params = BootParams::default();

        for word in tokenize(cmdline) {
            let (key, value) = match word.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (word.clone(), None),
            };
            let non_empty = value.clone().filter(|v| !v.is_empty());

            match key.as_str() {
                "root" => params.root = non_empty,
                "pool" => params.pool = non_empty,
                "by" => match non_empty {
                    Some(v) if SCAN_BY.contains(&v.as_str()) => params.by = Some(v),
                    Some(v) => tracing::warn!(value = %v, "ignoring unknown by= value"),
                    None => {}
                },
                "cachefile" => params.cachefile = non_empty.map(PathBuf::from),
                "refresh" => params.refresh = true,
                "enc_root" => {
                    params.enc_root = non_empty
                        .map(|v| {
                            v.split(',')
                                .filter(|d| !d.is_empty())
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default()
                }
                "enc_type" => match non_empty.as_deref().map(str::parse::<UnlockMethod>) {
                    Some(Ok(method)) => params.enc_type = Some(method),
                    Some(Err(_)) => tracing::warn!(value = ?non_empty, "ignoring unknown enc_type"),
                    None => {}
                },
                "enc_key" => params.enc_key = non_empty.map(PathBuf::from),
                "enc_key_drive" => params.enc_key_drive = non_empty,
                "enc_tries" => {
                    params.enc_tries = non_empty
                        .and_then(|v| number::<u32>("enc_tries", &v))
                        .filter(|n| *n > 0)
                }
                "keymap" => {
                    params.keymap = Some(non_empty.map_or_else(|| PathBuf::from(KEYMAP_PATH), PathBuf::from))
                }
                "options" => params.options = non_empty,
                "recover" => params.recover = true,
                "su" | "single" => params.single_user = true,
                "init" => params.init = non_empty.map(PathBuf::from),
                "settle_timeout" => {
                    params.settle_timeout = non_empty.and_then(|v| number("settle_timeout", &v))
                }
                "import_tries" => {
                    params.import_tries = non_empty
                        .and_then(|v| number::<u32>("import_tries", &v))
                        .filter(|n| *n > 0)
                }
                "import_delay" => {
                    params.import_delay = non_empty.and_then(|v| number("import_delay", &v))
                }
                _ => {}
            }
        }

        params
    }

    pub fn has(&self, param: Param) -> bool {
        match param {
            Param::Keymap => self.keymap.is_some(),
            Param::EncRoot => !self.enc_root.is_empty(),
            Param::Recover => self.recover,
        }
    }

    /// Root dataset named on the command line, if any. `root=zfs`,
    /// `root=zfs:AUTO` and a missing `root=` mean "use the pool's bootfs".
    pub fn root_dataset(&self) -> Option<&str> {
        let root = self.root.as_deref()?;
        let root = root
            .strip_prefix("ZFS=")
            .or_else(|| root.strip_prefix("zfs:"))
            .unwrap_or(root);
        match root {
            "" | "zfs" | "ZFS" | "AUTO" => None,
            dataset => Some(dataset),
        }
    }

    /// Pool to import: `pool=`, else the pool part of the root dataset.
    /// `None` means import everything.
    pub fn pool_name(&self) -> Option<String> {
        match self.pool.as_deref() {
            Some("all") => None,
            Some(pool) => Some(pool.to_string()),
            None => self
                .root_dataset()
                .and_then(|ds| ds.split('/').next())
                .map(str::to_string),
        }
    }

    pub fn init_path(&self) -> PathBuf {
        self.init.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_INIT))
    }

    /// Arguments for the real init.
    pub fn init_args(&self) -> Vec<String> {
        if self.single_user {
            vec!["single".to_string()]
        } else {
            Vec::new()
        }
    }

    /// `/dev/disk/by-<by>` when a scan hint was given.
    pub fn scan_dir(&self) -> Option<PathBuf> {
        self.by
            .as_ref()
            .map(|by| PathBuf::from(format!("/dev/disk/by-{}", by)))
    }

    /// Overlay command-line overrides (seconds) on the built-in policy.
    pub fn apply_retry(&self, policy: &RetryPolicy) -> RetryPolicy {
        let mut policy = policy.clone();
        if let Some(secs) = self.settle_timeout {
            policy.settle_timeout_ms = Duration::from_secs(secs).as_millis() as u64;
        }
        if let Some(tries) = self.import_tries {
            policy.import_attempts = tries;
        }
        if let Some(secs) = self.import_delay {
            policy.import_delay_ms = Duration::from_secs(secs).as_millis() as u64;
        }
        if let Some(tries) = self.enc_tries {
            policy.unlock_attempts = tries;
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typical_cmdline() {
        let params = BootParams::parse(
            "BOOT_IMAGE=/vmlinuz-6.6.30 root=tank/ROOT/gentoo by=id quiet enc_root=/dev/sda2,/dev/sdb2 enc_type=key_gpg",
        );
        assert_eq!(params.root_dataset(), Some("tank/ROOT/gentoo"));
        assert_eq!(params.pool_name(), Some("tank".to_string()));
        assert_eq!(params.scan_dir(), Some(PathBuf::from("/dev/disk/by-id")));
        assert_eq!(params.enc_root, vec!["/dev/sda2", "/dev/sdb2"]);
        assert_eq!(params.enc_type, Some(UnlockMethod::GpgKeyfile));
        assert!(params.has(Param::EncRoot));
        assert!(!params.has(Param::Keymap));
    }

    #[test]
    fn test_bootfs_forms() {
        for cmdline in ["root=zfs", "root=zfs:AUTO", "root=ZFS=", ""] {
            let params = BootParams::parse(cmdline);
            assert_eq!(params.root_dataset(), None, "{}", cmdline);
            assert_eq!(params.pool_name(), None);
        }
        let grub = BootParams::parse("root=ZFS=rpool/ROOT/debian");
        assert_eq!(grub.root_dataset(), Some("rpool/ROOT/debian"));
    }

    #[test]
    fn test_pool_all_and_explicit() {
        assert_eq!(BootParams::parse("root=tank/root pool=all").pool_name(), None);
        assert_eq!(
            BootParams::parse("root=tank/root pool=boot").pool_name(),
            Some("boot".to_string())
        );
    }

    #[test]
    fn test_unknown_and_malformed_ignored() {
        let params = BootParams::parse("splash enc_tries=lots by=magic import_tries=0 foo=bar");
        assert_eq!(params.enc_tries, None);
        assert_eq!(params.by, None);
        assert_eq!(params.import_tries, None);
    }

    #[test]
    fn test_bare_keymap_uses_embedded_path() {
        let params = BootParams::parse("keymap");
        assert_eq!(params.keymap, Some(PathBuf::from(KEYMAP_PATH)));
        assert!(params.has(Param::Keymap));
    }

    #[test]
    fn test_quoted_options() {
        let params = BootParams::parse(r#"root=tank/root options="noatime,ro" su"#);
        assert_eq!(params.options.as_deref(), Some("noatime,ro"));
        assert_eq!(params.init_args(), vec!["single"]);
        assert_eq!(params.init_path(), PathBuf::from(DEFAULT_INIT));
    }

    #[test]
    fn test_retry_overrides() {
        let params = BootParams::parse("settle_timeout=30 import_tries=10 import_delay=2 enc_tries=5");
        let policy = params.apply_retry(&RetryPolicy::default());
        assert_eq!(policy.settle_timeout_ms, 30_000);
        assert_eq!(policy.import_attempts, 10);
        assert_eq!(policy.import_delay_ms, 2_000);
        assert_eq!(policy.unlock_attempts, 5);
        assert_eq!(policy.stage_retries, RetryPolicy::default().stage_retries);
    }
}
