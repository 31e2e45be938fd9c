//! Resolve command - prints a module closure in load order.

use anyhow::{Context, Result};

use crate::config::BuildConfig;
use crate::modules::ModuleIndex;

pub fn cmd_resolve(config: &BuildConfig, modules: &[String]) -> Result<()> {
    let requested: &[String] = if modules.is_empty() {
        config.modules()
    } else {
        modules
    };

    let dir = config.modules_dir();
    let index = ModuleIndex::load(&dir, config.kernel_version())
        .with_context(|| format!("Loading module metadata from {}", dir.display()))?;
    let set = index.resolve(requested)?;

    println!(
        "=== Module closure for {} ({}) ===\n",
        requested.join(" "),
        config.kernel_version()
    );
    for module in set.load_order() {
        match &module.path {
            Some(path) => println!("  {:<24} {}", module.name, path.display()),
            None => println!("  {:<24} (built-in)", module.name),
        }
    }
    println!("\n{} module(s)", set.len());
    Ok(())
}
