//! Port-knocking gateway server
//!
//! Usage: knock-server [--config <path>]
//!
//! Without `--config` the server reads `server_config.json` next to the
//! executable.

use std::path::PathBuf;

use knock_core::config::default_path;
use knock_core::host::{ConsoleHost, ServiceHost};
use knock_core::logging;

use knock_server::config::DEFAULT_CONFIG_FILE;
use knock_server::{Server, ServerConfig, ServerError};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    let config_path = parse_arg(&args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_path(DEFAULT_CONFIG_FILE));

    let config = ServerConfig::load(&config_path)?;
    logging::init(&config.log_level)?;
    let settings = config.validate()?;

    log::info!("Knock server starting...");
    log::info!("  Config: {}", config_path.display());
    log::info!("  Auth:   {}", settings.auth_addr);
    for rule in &settings.rules {
        log::info!("  Rule:   {} -> {}", rule.bind_addr, rule.forward_addr);
    }

    let mut host = ConsoleHost::new();
    host.init(&config.service)?;
    log::debug!("platform {}, interactive {}", host.platform(), host.is_interactive());

    let mut failure: Option<ServerError> = None;
    host.run(&mut |shutdown| match Server::start(settings.clone(), shutdown) {
        Ok(mut server) => {
            shutdown.wait();
            log::info!("Knock server stopping...");
            server.join();
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
