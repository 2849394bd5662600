use super::open_store;
use aimatch_core::{Config, Paths};
use aimatch_storage::{AuditEvent, AuditLogger};

pub async fn run(paths: &Paths) -> anyhow::Result<()> {
    println!("aimatch status");
    println!("==============");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found, using defaults)" }
    );

    let config = Config::load_or_default(paths)?;
    println!("Sync URL:  {}", config.sync.url);
    println!(
        "Token:     {}",
        if config.sync.token.trim().is_empty() {
            "✗ not set"
        } else {
            "✓ set"
        }
    );
    println!("Chat URL:  {}", config.browser.chat_url);
    println!("Profile:   {}", config.profile_dir(paths).display());
    println!("Policy:    {:?}", config.queue.reprocess);
    println!();

    let db_path = config.queue_db_path(paths);
    if !db_path.exists() {
        println!("Queue:     {} ✗ (not created yet)", db_path.display());
    } else {
        let counts = open_store(&config, paths)?.counts()?;
        println!("Queue:     {}", db_path.display());
        println!("  PENDING     {:>6}", counts.pending);
        println!("  VERIFIED    {:>6}", counts.verified);
        println!("  IGNORED     {:>6}", counts.ignored);
        println!("  UNRESOLVED  {:>6}", counts.unresolved);
        println!("  total       {:>6}", counts.total());
    }

    let events = AuditLogger::new(paths.clone()).read_today()?;
    if !events.is_empty() {
        let verdicts = events
            .iter()
            .filter(|e| matches!(e, AuditEvent::TaskVerdict { .. }))
            .count();
        let failures = events
            .iter()
            .filter(|e| matches!(e, AuditEvent::TaskFailed { .. }))
            .count();
        let limits = events
            .iter()
            .filter(|e| matches!(e, AuditEvent::RateLimited { .. }))
            .count();
        println!();
        println!(
            "Today:     {} verdict(s), {} failure(s), {} quota stop(s)",
            verdicts, failures, limits
        );
    }

    if !config_exists {
        println!();
        println!("Run `aimatch onboard` to initialize.");
    }
    Ok(())
}
