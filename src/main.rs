use std::path::Path;

use anyhow::Result;
use tracing::info;

use cambrian::config::Settings;
use cambrian::repl::Console;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    info!("Program initialising...");

    let settings = Settings::load_or_default(Path::new("cambrian.json"));
    let mut console = Console::new(settings);

    info!("Program initialised.");
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    while console.run_loop(&mut input) {}

    info!("Program terminated.");
    Ok(())
}
