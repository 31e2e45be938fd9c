//! List command - collects without writing and prints every staged entry.

use anyhow::Result;

use crate::config::BuildConfig;
use crate::staging::EntryKind;

use super::build::{collect_tree, resolve_modules};

pub fn cmd_list(config: &BuildConfig) -> Result<()> {
    let modules = resolve_modules(config)?;
    let (tree, report) = collect_tree(config, &modules)?;

    for warning in &report.warnings {
        eprintln!("[WARN] {}", warning);
    }

    for entry in tree.iter() {
        let detail = match &entry.kind {
            EntryKind::Symlink(target) => format!(" -> {}", target.display()),
            EntryKind::CharDevice { major, minor } => format!(" ({}:{})", major, minor),
            _ => String::new(),
        };
        println!(
            "{:<8} {:04o} {}:{} {}{}",
            entry.kind.label(),
            entry.mode & 0o7777,
            entry.uid,
            entry.gid,
            entry.path.display(),
            detail
        );
    }
    println!("\n{} entries (dry run, nothing written)", tree.len());
    Ok(())
}
