//! Port-knocking gateway client
//!
//! Sends an encrypted UDP handshake for every configured `(token, port)`
//! entry on a fixed interval, keeping the server-side grant alive.

pub mod config;
pub mod metrics;
pub mod sender;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use knock_core::{spawn_periodic, AuthCodec, CodecError, Shutdown};

pub use config::{ClientConfig, ClientSettings};
pub use metrics::Metrics;
pub use sender::{AuthSender, FailureThrottle, SendError};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ClientError {
    /// Handshake cipher could not be built from a server key
    Codec(CodecError),
    /// Sender thread could not be spawned
    Spawn(io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Codec(e) => write!(f, "init auth cipher failed: {}", e),
            ClientError::Spawn(e) => write!(f, "spawn sender failed: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Codec(e) => Some(e),
            ClientError::Spawn(e) => Some(e),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Running senders
pub struct Client {
    tasks: Vec<JoinHandle<()>>,
    metrics: Arc<Metrics>,
}

/// Start one periodic sender per configured entry
pub fn start(settings: &ClientSettings, shutdown: &Shutdown) -> Result<Client, ClientError> {
    let metrics = Arc::new(Metrics::new());
    let mut client = Client {
        tasks: Vec::new(),
        metrics: Arc::clone(&metrics),
    };

    for server in &settings.servers {
        let codec = Arc::new(AuthCodec::new(&server.key).map_err(ClientError::Codec)?);
        for entry in &server.entries {
            log::info!(
                "start auth to port {} with token {}, re-auth interval {} seconds",
                entry.port,
                entry.token,
                entry.interval.as_secs()
            );
            let mut sender = AuthSender::new(
                server.addr.clone(),
                Arc::clone(&codec),
                entry.token.clone(),
                entry.port,
                Arc::clone(&metrics),
            );
            let name = format!("auth-{}-{}", entry.port, entry.token);
            match spawn_periodic(&name, entry.interval, shutdown, move || sender.tick()) {
                Ok(task) => client.tasks.push(task),
                Err(e) => {
                    shutdown.trigger();
                    client.join();
                    return Err(ClientError::Spawn(e));
                }
            }
        }
    }

    Ok(client)
}

impl Client {
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Number of sender tasks started
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every sender to exit. Call after triggering shutdown.
    pub fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let name = task.thread().name().unwrap_or("sender").to_string();
            if task.join().is_err() {
                log::error!("{} panicked", name);
            }
        }
        log::debug!("final metrics:\n{}", self.metrics.render());
    }
}
