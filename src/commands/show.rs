//! Show command - displays information.

use anyhow::{Context, Result};

use crate::config::BuildConfig;

/// Show target for the show command.
pub enum ShowTarget {
    /// Effective build configuration
    Config,
    /// Effective settings as JSON
    Settings,
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &BuildConfig) -> Result<()> {
    match target {
        ShowTarget::Config => {
            config.print();
            let retry = config.retry();
            println!("  Boot retry policy:");
            println!("    settle timeout: {} ms", retry.settle_timeout_ms);
            println!(
                "    import: {} attempts, {} ms apart",
                retry.import_attempts, retry.import_delay_ms
            );
            println!("    unlock attempts: {}", retry.unlock_attempts);
            println!("    stage retries: {}", retry.stage_retries);
        }
        ShowTarget::Settings => {
            let json = serde_json::to_string_pretty(config.settings())
                .context("Failed to serialize settings")?;
            println!("{}", json);
        }
    }
    Ok(())
}
