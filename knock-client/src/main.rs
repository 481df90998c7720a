//! Port-knocking gateway client
//!
//! Usage: knock-client [--config <path>]

use std::path::PathBuf;

use knock_core::config::default_path;
use knock_core::host::{ConsoleHost, ServiceHost};
use knock_core::logging;

use knock_client::config::DEFAULT_CONFIG_FILE;
use knock_client::{ClientConfig, ClientError};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    let config_path = parse_arg(&args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_path(DEFAULT_CONFIG_FILE));

    let config = ClientConfig::load(&config_path)?;
    logging::init(&config.log_level)?;
    let settings = config.validate()?;

    log::info!("Knock client starting...");
    log::info!("  Config:  {}", config_path.display());
    for server in &settings.servers {
        log::info!("  Server:  {} ({} entries)", server.addr, server.entries.len());
    }

    let mut host = ConsoleHost::new();
    host.init(&config.service)?;

    let mut failure: Option<ClientError> = None;
    host.run(&mut |shutdown| match knock_client::start(&settings, shutdown) {
        Ok(mut client) => {
            shutdown.wait();
            log::info!("Knock client stopping...");
            client.join();
        }
        Err(e) => failure = Some(e),
    })?;

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
