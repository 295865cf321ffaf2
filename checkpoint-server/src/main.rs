use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use tokio_graceful_shutdown::Toplevel;

use checkpoint_server::config::{default_config_path, Config};
use checkpoint_server::{Cli, Station};

/// Time subsystems get to finish after a shutdown request
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    let path = args.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load(&path).into_diagnostic()?;

    if args.check_config {
        println!("{}: OK", path.display());
        for line in config.summary() {
            println!("  {}", line);
        }
        return Ok(());
    }

    let station = Station::new(&args, config).into_diagnostic()?;

    Toplevel::new(|s| async move {
        station.start(&s);
    })
    .catch_signals()
    .handle_shutdown_requests(SHUTDOWN_TIMEOUT)
    .await
    .map_err(Into::into)
}
