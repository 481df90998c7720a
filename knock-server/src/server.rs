//! Server composition
//!
//! Wires the codec, replay cache, authorization store and metrics into the
//! UDP auth listener, one gate per forwarding rule, and the janitors. Every
//! task observes the same [`Shutdown`] and is joined by [`Server::join`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use knock_core::replay::{DEFAULT_RETENTION, PURGE_INTERVAL};
use knock_core::store::SWEEP_INTERVAL;
use knock_core::{
    spawn_periodic, AuthCodec, AuthorizationStore, CodecError, ReplayCache, RuleId, Shutdown, Tick,
};

use crate::config::ServerSettings;
use crate::gate::Gate;
use crate::handler::AuthHandler;
use crate::listener::AuthListener;
use crate::metrics::Metrics;

// ============================================================================
// Errors
// ============================================================================

/// Errors while starting the server
#[derive(Debug)]
pub enum ServerError {
    /// Handshake cipher could not be built from the key
    Codec(CodecError),
    /// UDP auth socket could not be bound
    AuthBind { addr: SocketAddr, source: io::Error },
    /// A rule's listening socket could not be bound
    GateBind { addr: SocketAddr, source: io::Error },
    /// Task thread could not be spawned
    Spawn(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Codec(e) => write!(f, "init auth cipher failed: {}", e),
            ServerError::AuthBind { addr, source } => {
                write!(f, "listen auth address {} failed: {}", addr, source)
            }
            ServerError::GateBind { addr, source } => {
                write!(f, "listen forward address {} failed: {}", addr, source)
            }
            ServerError::Spawn(e) => write!(f, "spawn task failed: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Codec(e) => Some(e),
            ServerError::AuthBind { source, .. } | ServerError::GateBind { source, .. } => {
                Some(source)
            }
            ServerError::Spawn(e) => Some(e),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// A running server
pub struct Server {
    auth_addr: SocketAddr,
    /// Bound gate address per rule, None where binding failed
    gate_addrs: Vec<Option<SocketAddr>>,
    gate_errors: Vec<(RuleId, ServerError)>,
    store: Arc<AuthorizationStore>,
    metrics: Arc<Metrics>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind every socket and start all tasks.
    ///
    /// A rule whose address cannot be bound is skipped and recorded in
    /// [`gate_errors`](Self::gate_errors); the other rules still run.
    pub fn start(settings: ServerSettings, shutdown: &Shutdown) -> Result<Server, ServerError> {
        let codec = AuthCodec::new(&settings.auth_key).map_err(ServerError::Codec)?;
        let store = Arc::new(AuthorizationStore::new(settings.global.clone(), &settings.rules));
        let replay = Arc::new(ReplayCache::new(DEFAULT_RETENTION));
        let metrics = Arc::new(Metrics::new());

        let handler = AuthHandler::new(codec, Arc::clone(&replay), Arc::clone(&store), Arc::clone(&metrics));
        let listener = AuthListener::bind(settings.auth_addr, handler).map_err(|source| {
            ServerError::AuthBind {
                addr: settings.auth_addr,
                source,
            }
        })?;
        let auth_addr = listener.local_addr().map_err(|source| ServerError::AuthBind {
            addr: settings.auth_addr,
            source,
        })?;

        let mut gates = Vec::new();
        let mut gate_addrs = Vec::new();
        let mut gate_errors = Vec::new();
        for (idx, rule) in settings.rules.iter().enumerate() {
            let id = RuleId(idx);
            match Gate::bind(id, rule, Arc::clone(&store), Arc::clone(&metrics)) {
                Ok(gate) => {
                    gate_addrs.push(Some(gate.local_addr()));
                    gates.push(gate);
                }
                Err(source) => {
                    let err = ServerError::GateBind {
                        addr: rule.bind_addr,
                        source,
                    };
                    log::error!("{}", err);
                    gate_addrs.push(None);
                    gate_errors.push((id, err));
                }
            }
        }

        let mut server = Server {
            auth_addr,
            gate_addrs,
            gate_errors,
            store,
            metrics,
            tasks: Vec::new(),
        };

        if let Err(e) = server.spawn_tasks(listener, gates, replay, shutdown) {
            shutdown.trigger();
            server.join();
            return Err(ServerError::Spawn(e));
        }

        log::info!("server started, {} rules", settings.rules.len());
        Ok(server)
    }

    fn spawn_tasks(
        &mut self,
        listener: AuthListener,
        gates: Vec<Gate>,
        replay: Arc<ReplayCache>,
        shutdown: &Shutdown,
    ) -> io::Result<()> {
        let handle = shutdown.clone();
        self.tasks.push(thread::Builder::new().name("auth-listener".into()).spawn(move || {
            if let Err(e) = listener.run(&handle) {
                log::error!("auth listener failed: {}", e);
            }
        })?);

        self.tasks.push(spawn_periodic("replay-janitor", PURGE_INTERVAL, shutdown, move || {
            let purged = replay.purge();
            if purged > 0 {
                log::debug!("purged {} handshake nonces", purged);
            }
            Tick::Continue
        })?);

        for gate in gates {
            let handle = shutdown.clone();
            let name = format!("gate-{}", gate.local_addr().port());
            self.tasks.push(thread::Builder::new().name(name).spawn(move || {
                let addr = gate.local_addr();
                if let Err(e) = gate.run(&handle) {
                    log::error!("gate {} failed: {}", addr, e);
                }
            })?);
        }

        for rule in self.store.rule_ids() {
            let store = Arc::clone(&self.store);
            let port = store.port(rule).unwrap_or_default();
            let name = format!("sweep-{}", rule.0);
            self.tasks.push(spawn_periodic(&name, SWEEP_INTERVAL, shutdown, move || {
                for ip in store.sweep(rule) {
                    log::info!("Auth IP {} to port {} expired", ip, port);
                }
                Tick::Continue
            })?);
        }

        Ok(())
    }

    pub fn auth_addr(&self) -> SocketAddr {
        self.auth_addr
    }

    /// Bound address of a rule's gate
    pub fn gate_addr(&self, rule: RuleId) -> Option<SocketAddr> {
        self.gate_addrs.get(rule.0).copied().flatten()
    }

    /// Rules whose gate failed to bind
    pub fn gate_errors(&self) -> &[(RuleId, ServerError)] {
        &self.gate_errors
    }

    pub fn store(&self) -> &Arc<AuthorizationStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Wait for every task to exit. Call after triggering shutdown; gates
    /// return once their proxied connections have drained.
    pub fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let name = task.thread().name().unwrap_or("task").to_string();
            if task.join().is_err() {
                log::error!("{} panicked", name);
            }
        }
        log::debug!("final metrics:\n{}", self.metrics.render());
    }
}
