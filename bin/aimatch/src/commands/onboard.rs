use aimatch_core::{Config, Paths};
use std::io::{self, Write};

pub async fn run(paths: &Paths, force: bool) -> anyhow::Result<()> {
    if paths.config_file().exists() && !force {
        print!("Config already exists. Overwrite? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    paths.ensure_dirs()?;
    Config::default().save(&paths.config_file())?;
    println!("✓ Created config: {}", paths.config_file().display());
    println!("✓ Browser profile: {}", paths.browser_profile_dir().display());
    println!();
    println!("Next steps:");
    println!(
        "  1. Set sync.token in {} (or export AIMATCH_SYNC_TOKEN)",
        paths.config_file().display()
    );
    println!("  2. Run `aimatch login` and sign in to the chat once");
    println!("  3. Run `aimatch run` to start processing the queue");

    Ok(())
}
