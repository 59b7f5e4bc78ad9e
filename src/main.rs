//! Command host — interactive entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Start the host (registry, coordinator, dispatcher, core commands)
//!   6. Spawn Ctrl-C → shutdown signal watcher
//!   7. Run the console channel until shutdown
//!   8. Deactivate extensions and join components

use std::path::PathBuf;

use tracing::info;

use command_host::host::runtime::{Component, spawn_components};
use command_host::{AppError, CommandHost, config, logger};

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<PathBuf>,
    console: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let mut config = config::load(args.config_path.as_deref())?;
    if !args.console {
        config.console.enabled = false;
    }

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    logger::init(effective_log_level, args.log_level.is_some(), config.log_file.as_deref())?;

    info!(
        host = %config.host_name,
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        console = config.console.enabled,
        plugins = config.plugins.len(),
        "config loaded"
    );

    let host = CommandHost::start(config).await?;
    let shutdown = host.shutdown_token();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received — initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    if host.config().console.enabled {
        let channels: Vec<Box<dyn Component>> = vec![Box::new(host.console())];
        spawn_components(channels, shutdown.clone()).join().await?;
    } else {
        host.wait().await;
    }

    host.shutdown().await?;

    use std::io::Write as _;
    println!("\nBye :) ...");
    let _ = std::io::stdout().flush();
    Ok(())
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut console = true;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: command-host [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("      --no-console           Do not read commands from stdin");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "--no-console" => console = false,
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    //   -v → warn, -vv → info, -vvv → debug, -vvvv+ → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs { log_level, config_path, console }
}
