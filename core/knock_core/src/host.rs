//! Process host capability
//!
//! Binaries run their composition inside a [`ServiceHost`]; the core never
//! depends on how the process is hosted. [`ConsoleHost`] runs in the
//! foreground and turns SIGINT/SIGTERM into a [`Shutdown`] trigger.
//! Service-manager hosts plug in behind the same trait.

use std::io::{self, IsTerminal};
use std::thread;

use serde::Deserialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::shutdown::Shutdown;

/// Service identity passed to the host at startup
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceOption {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

/// Integration point between a binary and whatever runs it
pub trait ServiceHost {
    /// Prepare the host with the service identity
    fn init(&mut self, option: &ServiceOption) -> io::Result<()>;

    /// Whether the process is attached to a terminal
    fn is_interactive(&self) -> bool;

    /// Name of the platform the host runs on
    fn platform(&self) -> &str;

    /// Run `main` until it returns. `main` must block until the given
    /// shutdown is triggered; the host triggers it on a stop request.
    fn run(&mut self, main: &mut dyn FnMut(&Shutdown)) -> io::Result<()>;
}

// ============================================================================
// Console Host
// ============================================================================

/// Foreground host stopped by SIGINT or SIGTERM
#[derive(Debug, Default)]
pub struct ConsoleHost {
    option: ServiceOption,
}

impl ConsoleHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceHost for ConsoleHost {
    fn init(&mut self, option: &ServiceOption) -> io::Result<()> {
        self.option = option.clone();
        Ok(())
    }

    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn platform(&self) -> &str {
        std::env::consts::OS
    }

    fn run(&mut self, main: &mut dyn FnMut(&Shutdown)) -> io::Result<()> {
        let shutdown = Shutdown::new();

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let signal_handle = signals.handle();
        let trigger = shutdown.clone();
        let watcher = thread::Builder::new()
            .name("signal-watcher".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    log::info!("Received signal {}, shutting down", sig);
                    trigger.trigger();
                }
            })?;

        if !self.option.name.is_empty() {
            log::debug!("Running service '{}'", self.option.name);
        }

        main(&shutdown);

        shutdown.trigger();
        signal_handle.close();
        if watcher.join().is_err() {
            log::warn!("Signal watcher panicked");
        }
        Ok(())
    }
}
