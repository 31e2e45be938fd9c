//! Build host checks.
//!
//! Validates the host before a build: supported architecture, kernel module
//! metadata, host tools on `PATH`, and every file the selected features
//! need. Run with `zboot preflight`.

mod types;

use anyhow::{bail, Result};
use std::path::Path;

use crate::collect::LOADKEYS_PATHS;
use crate::config::{BuildConfig, Feature, KeymapSource};
use crate::modules::ModuleIndex;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Architectures the init and the library layout are known to work on.
pub const SUPPORTED_ARCHES: &[&str] = &["x86_64", "aarch64"];

/// Run all checks against `config`.
pub fn run_preflight(config: &BuildConfig) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    println!("Checking host...");
    checks.push(check_architecture(std::env::consts::ARCH));

    println!("Checking host tools...");
    checks.extend(check_host_tools(config, |tool| {
        which::which(tool).ok().map(|p| p.display().to_string())
    }));

    println!("Checking kernel modules...");
    checks.extend(check_modules(config));

    println!("Checking required files...");
    checks.extend(check_files(config));

    println!();
    PreflightReport { checks }
}

/// Run preflight and bail if any check fails.
pub fn run_preflight_or_fail(config: &BuildConfig) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}

pub fn check_architecture(arch: &str) -> CheckResult {
    if SUPPORTED_ARCHES.contains(&arch) {
        CheckResult::pass_with("architecture", arch)
    } else {
        CheckResult::fail(
            "architecture",
            &format!("{} is not supported (supported: {})", arch, SUPPORTED_ARCHES.join(", ")),
        )
    }
}

/// `preliminaryBuildBinaries` from the settings, plus `dumpkeys` when the
/// host keymap will be dumped.
pub fn check_host_tools(
    config: &BuildConfig,
    which: impl Fn(&str) -> Option<String>,
) -> Vec<CheckResult> {
    let mut results: Vec<CheckResult> = config
        .settings()
        .preliminary_build_binaries
        .iter()
        .map(|tool| match which(tool.as_str()) {
            Some(path) => CheckResult::pass_with(tool, &path),
            None => CheckResult::fail(tool, "Not found on PATH"),
        })
        .collect();

    if config.keymap() == Some(&KeymapSource::Dump) {
        results.push(match which("dumpkeys") {
            Some(path) => CheckResult::pass_with("dumpkeys", &path),
            None => CheckResult::warn("dumpkeys", "Not found - the image will use the kernel keymap"),
        });
    }
    results
}

pub fn check_modules(config: &BuildConfig) -> Vec<CheckResult> {
    let dir = config.modules_dir();
    let index = match ModuleIndex::load(&dir, config.kernel_version()) {
        Ok(index) => index,
        Err(e) => return vec![CheckResult::fail("module metadata", &e.to_string())],
    };

    let mut results = vec![CheckResult::pass_with(
        "module metadata",
        &format!("{} modules for {}", index.len(), config.kernel_version()),
    )];
    for module in config.modules() {
        results.push(if index.contains(module) {
            CheckResult::pass(&format!("module {}", module))
        } else {
            CheckResult::fail(
                &format!("module {}", module),
                &format!("not available for kernel {}", config.kernel_version()),
            )
        });
    }
    results
}

pub fn check_files(config: &BuildConfig) -> Vec<CheckResult> {
    let settings = config.settings();
    let mut results = Vec::new();

    let required = |path: &Path| {
        let name = path.display().to_string();
        if config.host_path(path).exists() {
            CheckResult::pass(&name)
        } else {
            CheckResult::fail(&name, "required file not found")
        }
    };

    results.push(if config.init_binary().exists() {
        CheckResult::pass_with("init binary", &config.init_binary().display().to_string())
    } else {
        CheckResult::fail(
            "init binary",
            &format!("{} not found (set ZBOOT_INIT_BINARY)", config.init_binary().display()),
        )
    });

    for file in &settings.base.files {
        results.push(required(file));
    }
    if !settings.base.files.contains(&settings.base.udev_path) {
        results.push(required(&settings.base.udev_path));
    }

    if config.has_feature(Feature::Zfs) {
        for file in &settings.zfs.files {
            results.push(required(file));
        }
        for file in &settings.zfs.optional_files {
            let name = file.display().to_string();
            results.push(if config.host_path(file).exists() {
                CheckResult::pass(&name)
            } else {
                CheckResult::warn(&name, "optional file not found")
            });
        }
    }

    if config.has_feature(Feature::Luks) {
        for file in &settings.luks.files {
            results.push(required(file));
        }
        if let (true, Some(key)) = (settings.luks.use_keyfile, &settings.luks.keyfile_path) {
            results.push(required(key));
        }
        if let (true, Some(header)) = (
            settings.luks.use_detached_header,
            &settings.luks.detached_header_path,
        ) {
            results.push(required(header));
        }
    } else {
        results.push(CheckResult::skip("luks helpers", "luks feature not enabled"));
    }

    if let Some(KeymapSource::File(path)) = config.keymap() {
        results.push(required(path));
    }
    if config.keymap().is_some() {
        let found = LOADKEYS_PATHS
            .iter()
            .find(|tool| config.host_path(Path::new(tool)).exists());
        results.push(match found {
            Some(tool) => CheckResult::pass_with("loadkeys", tool),
            None => CheckResult::fail("loadkeys", "required to load the keymap at boot"),
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_architecture() {
        assert_eq!(check_architecture("x86_64").status, CheckStatus::Pass);
        assert_eq!(check_architecture("riscv64").status, CheckStatus::Fail);
    }

    #[test]
    fn test_host_tools_use_lookup() {
        let mut settings = Settings::defaults();
        settings.preliminary_build_binaries = vec!["cpio".into(), "gzip".into()];
        let config = BuildConfig::builder("6.6.30")
            .settings(settings)
            .feature(Feature::Keymap)
            .build()
            .unwrap();

        let results = check_host_tools(&config, |tool| (tool == "gzip").then(|| "/bin/gzip".to_string()));
        let status = |name: &str| results.iter().find(|r| r.name == name).unwrap().status;
        assert_eq!(status("cpio"), CheckStatus::Fail);
        assert_eq!(status("gzip"), CheckStatus::Pass);
        assert_eq!(status("dumpkeys"), CheckStatus::Warn);
    }

    #[test]
    fn test_missing_files_fail() {
        let host = TempDir::new().unwrap();
        fs::create_dir_all(host.path().join("sbin")).unwrap();
        fs::write(host.path().join("sbin/zfs"), b"").unwrap();

        let mut settings = Settings::defaults();
        settings.base.files = vec![];
        settings.zfs.files = vec![PathBuf::from("/sbin/zfs"), PathBuf::from("/sbin/zpool")];
        settings.zfs.optional_files = vec![PathBuf::from("/etc/hostid")];
        let config = BuildConfig::builder("6.6.30")
            .settings(settings)
            .host_root(host.path())
            .build()
            .unwrap();

        let results = check_files(&config);
        let status = |name: &str| results.iter().find(|r| r.name == name).unwrap().status;
        assert_eq!(status("/sbin/zfs"), CheckStatus::Pass);
        assert_eq!(status("/sbin/zpool"), CheckStatus::Fail);
        assert_eq!(status("/etc/hostid"), CheckStatus::Warn);
        assert_eq!(status("luks helpers"), CheckStatus::Skip);
        assert!(results.iter().all(|r| r.name != "loadkeys"));
    }

    #[test]
    fn test_keymap_needs_loadkeys() {
        let host = TempDir::new().unwrap();
        let mut settings = Settings::defaults();
        settings.base.files = vec![];
        let config = BuildConfig::builder("6.6.30")
            .settings(settings)
            .host_root(host.path())
            .feature(Feature::Keymap)
            .build()
            .unwrap();
        let loadkeys = |config: &BuildConfig| {
            check_files(config)
                .into_iter()
                .find(|r| r.name == "loadkeys")
                .unwrap()
                .status
        };
        assert_eq!(loadkeys(&config), CheckStatus::Fail);

        fs::create_dir_all(host.path().join("bin")).unwrap();
        fs::write(host.path().join("bin/loadkeys"), b"").unwrap();
        assert_eq!(loadkeys(&config), CheckStatus::Pass);
    }

    #[test]
    fn test_missing_module_metadata() {
        let host = TempDir::new().unwrap();
        let config = BuildConfig::builder("6.6.30")
            .host_root(host.path())
            .build()
            .unwrap();
        let results = check_modules(&config);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CheckStatus::Fail);
    }
}
