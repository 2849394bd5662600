use super::{build_sync, open_store};
use aimatch_browser::{BrowserEngine, ChromeProvider};
use aimatch_core::{Config, Paths};
use aimatch_processor::{ComparisonProtocol, ProtocolSettings, TaskProcessor};
use aimatch_scheduler::QueueService;
use aimatch_storage::AuditLogger;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub async fn run(paths: &Paths, once: bool) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    let config = Config::load_or_default(paths)?;
    config.validate_for_run()?;

    let store = open_store(&config, paths)?;
    let audit = AuditLogger::new(paths.clone());
    let sync = build_sync(&config, store.clone()).with_audit(audit.clone());

    let engine = BrowserEngine::from_str(&config.browser.engine);
    let provider = ChromeProvider::new(engine, config.profile_dir(paths), config.browser.headed);
    let protocol = ComparisonProtocol::new(ProtocolSettings::from_config(
        &config.browser,
        &config.protocol,
    ));
    let processor = TaskProcessor::new(Arc::new(provider), store, protocol)
        .with_policy(config.queue.reprocess)
        .with_restart_delay(config.run_loop.session_restart())
        .with_sync(sync.clone())
        .with_audit(audit);

    let mut service = QueueService::new(sync, processor).with_run_loop_config(&config.run_loop);

    info!(
        engine = engine.name(),
        chat_url = %config.browser.chat_url,
        policy = ?config.queue.reprocess,
        "Starting AI queue"
    );

    if once {
        let report = service.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_rx = shutdown_tx.subscribe();
    let mut handle = tokio::spawn(service.run_loop(shutdown_rx));

    tokio::select! {
        res = &mut handle => {
            res?;
            return Ok(());
        }
        res = tokio::signal::ctrl_c() => res?,
    }

    info!("Shutdown signal received, stopping after the current cycle (Ctrl-C again to abort)");
    let _ = shutdown_tx.send(());

    tokio::select! {
        res = &mut handle => res?,
        res = tokio::signal::ctrl_c() => {
            res?;
            warn!("Aborting the current cycle; unfinished tasks stay PENDING");
            handle.abort();
        }
    }

    Ok(())
}
