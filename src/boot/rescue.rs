//! The terminal rescue shell.

use std::time::Duration;

use super::sequencer::{BootReport, BootState, Outcome};
use super::system::BootSystem;

/// Text shown before every rescue shell session.
pub fn banner(report: &BootReport, reason: &str) -> String {
    let mut lines = vec![
        String::new(),
        "=== zboot rescue shell ===".to_string(),
        format!("  Reason: {}", reason),
    ];
    if let BootState::RescueShell {
        stage: Some(stage), ..
    } = report.state
    {
        lines.push(format!("  Stopped at stage: {}", stage));
    }

    for record in &report.history {
        let outcome = match &record.outcome {
            Outcome::Succeeded { .. } => "ok".to_string(),
            Outcome::Skipped => "skipped".to_string(),
            Outcome::Degraded(e) => format!("degraded: {}", e),
            Outcome::Failed(e) => format!("FAILED: {}", e),
        };
        lines.push(format!("    {:<16} {}", record.stage, outcome));
    }

    let ctx = &report.context;
    if !ctx.unlocked().is_empty() {
        let devices: Vec<&str> = ctx.unlocked().iter().map(|h| h.device.as_str()).collect();
        lines.push(format!("  Unlocked: {}", devices.join(", ")));
    }
    if !ctx.imported_pools().is_empty() {
        lines.push(format!("  Imported pools: {}", ctx.imported_pools().join(", ")));
    }
    if let Some(root) = ctx.root() {
        lines.push(format!(
            "  Root: {} mounted at {}",
            root.dataset,
            root.target.display()
        ));
        lines.push(format!(
            "  To continue booting: exec switch_root {} {}",
            root.target.display(),
            ctx.params().init_path().display()
        ));
    }
    lines.push("  Boot will not be retried automatically.".to_string());
    lines.join("\n")
}

/// Run rescue shell sessions. With `sessions = None` this never returns:
/// the init must not exit, so every shell that ends is started again.
pub fn enter<S: BootSystem>(system: &mut S, banner: &str, sessions: Option<u32>) {
    let mut count = 0;
    loop {
        eprintln!("{}", banner);
        if let Err(e) = system.rescue_shell() {
            tracing::error!(error = %e, "rescue shell failed");
            system.sleep(Duration::from_secs(1));
        }
        count += 1;
        if sessions.is_some_and(|max| count >= max) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::cmdline::BootParams;
    use crate::boot::context::BootContext;
    use crate::boot::fake::FakeSystem;
    use crate::boot::sequencer::StageRecord;
    use crate::manifest::BootManifest;

    #[test]
    fn test_banner_names_failed_stage() {
        let report = BootReport {
            state: BootState::RescueShell {
                stage: Some("unlock"),
                reason: "authentication failed".into(),
            },
            context: BootContext::new(BootParams::default(), BootManifest::new("6.6.30")),
            history: vec![
                StageRecord {
                    stage: "load-modules",
                    outcome: Outcome::Succeeded { attempts: 1 },
                },
                StageRecord {
                    stage: "unlock",
                    outcome: Outcome::Failed("authentication failed".into()),
                },
            ],
        };
        let text = banner(&report, "authentication failed");
        assert!(text.contains("Stopped at stage: unlock"));
        assert!(text.contains("FAILED: authentication failed"));
        assert!(!text.contains("Root:"));
    }

    #[test]
    fn test_shell_is_respawned() {
        let mut system = FakeSystem::new();
        enter(&mut system, "rescue", Some(3));
        assert_eq!(system.rescue_sessions, 3);
    }
}
