use super::{build_sync, open_store};
use aimatch_core::{Config, Paths};
use aimatch_storage::AuditLogger;

pub async fn run(paths: &Paths, pull: bool, push: bool) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    let config = Config::load_or_default(paths)?;
    config.validate_for_run()?;

    let store = open_store(&config, paths)?;
    let sync = build_sync(&config, store).with_audit(AuditLogger::new(paths.clone()));

    if pull {
        let added = sync.pull_pending().await?;
        println!("✓ Pulled {} new task(s)", added.len());
        for task in &added {
            println!("  {:>8}  {}", task.id, task.competitor_url);
        }
    }

    if push {
        let pushed = sync.push_statuses().await?;
        println!("✓ Pushed {} status(es)", pushed);
    }

    Ok(())
}
