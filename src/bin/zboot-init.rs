//! zboot-init - `/init` inside the image.
//!
//! Mounts the pseudo filesystems, runs the boot pipeline and either
//! switches to the real root or drops to the rescue shell. Runs as PID 1,
//! so it never exits.

use std::fs;
use std::path::Path;

use tracing_subscriber::EnvFilter;

use zboot::boot::{self, rescue, BootState, BootSystem, HostSystem};
use zboot::manifest::{BootManifest, MANIFEST_PATH};

fn init_tracing(cmdline: &str) {
    let level = if cmdline.split_whitespace().any(|w| w == "debug" || w == "zboot.debug") {
        "debug"
    } else if cmdline.split_whitespace().any(|w| w == "quiet") {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .without_time()
        .with_ansi(false)
        .with_target(false)
        .init();
}

fn main() {
    let mut system = HostSystem::new();
    let early = system.mount_pseudo_filesystems();

    let cmdline = fs::read_to_string("/proc/cmdline").unwrap_or_default();
    init_tracing(&cmdline);

    if let Err(e) = early {
        tracing::error!(error = %e, "mounting pseudo filesystems failed");
        rescue::enter(&mut system, &format!("Early setup failed: {}", e), None);
        return;
    }

    let manifest = match BootManifest::load(Path::new(MANIFEST_PATH)) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::error!(error = %e, path = MANIFEST_PATH, "unreadable boot manifest");
            rescue::enter(&mut system, &format!("Cannot read {}: {}", MANIFEST_PATH, e), None);
            return;
        }
    };
    tracing::info!(
        version = %manifest.version,
        kernel = %manifest.kernel_version,
        "zboot-init starting"
    );

    let report = boot::run(&mut system, &cmdline, manifest);
    let reason = match report.state {
        BootState::Succeeded => match boot::switch_root(&mut system, &report) {
            Ok(()) => "switch_root returned unexpectedly".to_string(),
            Err(e) => e.to_string(),
        },
        BootState::RescueShell { ref reason, .. } => reason.clone(),
        BootState::Running(index) => format!("pipeline stopped at stage {}", index),
    };

    let banner = rescue::banner(&report, &reason);
    rescue::enter(&mut system, &banner, None);
}
