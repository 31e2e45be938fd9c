//! Build command - resolves modules, collects the image and writes it.

use anyhow::{Context, Result};

use crate::archive::{self, ImageInfo};
use crate::collect::{self, CollectReport};
use crate::config::BuildConfig;
use crate::modules::{ModuleIndex, ModuleSet};
use crate::preflight;
use crate::staging::StagingTree;
use crate::timing::Timer;

/// Execute the build command.
pub fn cmd_build(config: &BuildConfig, skip_preflight: bool) -> Result<ImageInfo> {
    println!("=== Building initramfs for {} ===\n", config.kernel_version());
    let total = Timer::start("Total");

    if !skip_preflight {
        preflight::run_preflight_or_fail(config)?;
    }

    println!("Resolving kernel modules...");
    let timer = Timer::start("Resolve modules");
    let modules = resolve_modules(config)?;
    println!(
        "  {} requested, {} in closure",
        modules.requested().len(),
        modules.len()
    );
    timer.finish();

    println!("\nCollecting image contents...");
    let timer = Timer::start("Collect");
    let (tree, report) = collect_tree(config, &modules)?;
    print_report(&report, &tree);
    timer.finish();

    println!("\nWriting archive...");
    let timer = Timer::start("Archive");
    let sealed = tree.finalize();
    let info = archive::write_image(&sealed, config)
        .with_context(|| format!("Failed to write {}", config.output().display()))?;
    timer.finish();

    println!("\n=== Build Complete ===");
    println!("  Image: {}", info.path.display());
    println!("  Size: {:.1} MB", info.size as f64 / 1_048_576.0);
    println!("  Entries: {}", info.entries);
    println!("  SHA-256: {}", info.sha256);
    total.finish();

    Ok(info)
}

/// Load module metadata for the configured kernel and resolve the request.
pub fn resolve_modules(config: &BuildConfig) -> Result<ModuleSet> {
    let dir = config.modules_dir();
    let index = ModuleIndex::load(&dir, config.kernel_version())
        .with_context(|| format!("Loading module metadata from {}", dir.display()))?;
    let set = index.resolve(config.modules())?;
    Ok(set)
}

/// Run the collector into a fresh staging tree.
pub fn collect_tree(
    config: &BuildConfig,
    modules: &ModuleSet,
) -> Result<(StagingTree, CollectReport)> {
    let mut tree = StagingTree::new();
    let report = collect::collect(&mut tree, modules, config).context("Collecting image contents")?;
    Ok((tree, report))
}

fn print_report(report: &CollectReport, tree: &StagingTree) {
    for warning in &report.warnings {
        eprintln!("  [WARN] {}", warning);
    }
    println!("  {} executables", report.executables);
    println!("  {} shared libraries", report.libraries);
    println!("  {} kernel modules", report.modules);
    println!("  {} entries staged", tree.len());
}
