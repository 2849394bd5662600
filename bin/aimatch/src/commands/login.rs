use aimatch_browser::{BrowserEngine, ChromeProvider, SessionHandle};
use aimatch_core::{Config, Paths};
use std::time::Duration;

/// Open a visible browser on the persistent profile so the chat login can be
/// completed by hand. Later headless runs reuse the same profile.
pub async fn run(paths: &Paths, wait_secs: Option<u64>) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    let config = Config::load_or_default(paths)?;

    let engine = BrowserEngine::from_str(&config.browser.engine);
    let profile_dir = config.profile_dir(paths);
    let provider = ChromeProvider::new(engine, profile_dir.clone(), true);

    let mut session = provider.launch().await?;
    session.navigate(&config.browser.chat_url).await?;

    println!("Browser opened at {}", config.browser.chat_url);
    println!("Profile:  {}", profile_dir.display());
    println!();
    match wait_secs {
        Some(secs) => {
            println!("Sign in now. The browser closes in {}s (or on Ctrl-C).", secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                res = tokio::signal::ctrl_c() => res?,
            }
        }
        None => {
            println!("Sign in now, then press Ctrl-C to close the browser.");
            tokio::signal::ctrl_c().await?;
        }
    }

    session.close().await?;
    println!("✓ Login session closed. Run `aimatch run` to start processing.");
    Ok(())
}
