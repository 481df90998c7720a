//! Forwarding gate
//!
//! One mio poll loop per forwarding rule. It multiplexes:
//! - the TCP listener (admission decided once, at accept time)
//! - every proxied client/backend pair, pumped in both directions
//! - connections refused but held open until their drop delay passes
//!
//! On shutdown the gate stops accepting and releases held connections, then
//! keeps pumping existing pairs until they end.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{SockRef, TcpKeepalive};

use knock_core::{AuthorizationStore, ForwardRule, RuleId, Shutdown};

use crate::metrics::Metrics;

// ============================================================================
// Constants
// ============================================================================

/// Keep-alive period set on admitted client connections
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Read size for one pump step
const SCRATCH_SIZE: usize = 16 * 1024;

/// mio token for the TCP listener
const LISTENER_TOKEN: Token = Token(0);

/// mio token for the shutdown waker
const WAKER_TOKEN: Token = Token(1);

/// First token handed out to proxied streams
const FIRST_STREAM_TOKEN: usize = 2;

// ============================================================================
// Proxied Pair
// ============================================================================

/// Result of pumping a pair
enum Pump {
    /// Waiting on readiness
    Pending,
    /// Pair finished, tear it down
    Done,
}

/// One admitted client and its backend connection
struct Session {
    client: TcpStream,
    backend: TcpStream,
    client_token: Token,
    backend_token: Token,
    peer: SocketAddr,
    /// Backend connect has completed
    connected: bool,
    /// One side reached EOF; flush what is buffered and finish
    closing: bool,
    /// client → backend bytes not yet written
    upstream: Vec<u8>,
    /// backend → client bytes not yet written
    downstream: Vec<u8>,
}

impl Session {
    /// Check a non-blocking connect. `Ok(false)` means still in progress.
    fn check_connected(&mut self) -> io::Result<bool> {
        if let Some(e) = self.backend.take_error()? {
            return Err(e);
        }
        match self.backend.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move as many bytes as readiness allows. Stops reading a side while
    /// its outgoing buffer is non-empty, so buffering stays bounded.
    fn pump(&mut self, scratch: &mut [u8], metrics: &Metrics) -> io::Result<Pump> {
        loop {
            let mut progressed = false;

            let written = flush(&mut self.backend, &mut self.upstream)?
                + flush(&mut self.client, &mut self.downstream)?;
            if written > 0 {
                metrics
                    .bytes_forwarded_total
                    .fetch_add(written as u64, Ordering::Relaxed);
                progressed = true;
            }

            if self.closing {
                if self.upstream.is_empty() && self.downstream.is_empty() {
                    return Ok(Pump::Done);
                }
                return Ok(Pump::Pending);
            }

            if self.upstream.is_empty() {
                match fill(&mut self.client, scratch, &mut self.upstream)? {
                    Fill::Data => progressed = true,
                    Fill::Eof => self.closing = true,
                    Fill::Blocked => {}
                }
            }
            if !self.closing && self.downstream.is_empty() {
                match fill(&mut self.backend, scratch, &mut self.downstream)? {
                    Fill::Data => progressed = true,
                    Fill::Eof => self.closing = true,
                    Fill::Blocked => {}
                }
            }

            if !progressed && !self.closing {
                return Ok(Pump::Pending);
            }
        }
    }
}

enum Fill {
    Data,
    Eof,
    Blocked,
}

/// Read once from `src` into `buf`
fn fill(src: &mut TcpStream, scratch: &mut [u8], buf: &mut Vec<u8>) -> io::Result<Fill> {
    loop {
        match src.read(scratch) {
            Ok(0) => return Ok(Fill::Eof),
            Ok(n) => {
                buf.extend_from_slice(&scratch[..n]);
                return Ok(Fill::Data);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write `buf` to `dst` until it is empty or the socket would block.
/// Returns the number of bytes written.
fn flush(dst: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match dst.write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.drain(..written);
    Ok(written)
}

/// Enable TCP keep-alive probes after [`KEEPALIVE_PERIOD`] of idleness
fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Refused connection kept open until its drop delay passes
struct HeldConnection {
    _stream: TcpStream,
    peer: SocketAddr,
    deadline: Instant,
}

// ============================================================================
// Gate
// ============================================================================

pub struct Gate {
    /// Store partition this gate consults
    rule: RuleId,
    forward_addr: SocketAddr,
    drop_delay: Duration,
    max_connections: Option<u32>,
    poll: Poll,
    /// None once shutdown has begun
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    store: Arc<AuthorizationStore>,
    metrics: Arc<Metrics>,
    /// Live pairs keyed by client token
    sessions: HashMap<Token, Session>,
    /// Both tokens of a pair → its client token
    routes: HashMap<Token, Token>,
    /// Ordered by deadline (constant delay, pushed in accept order)
    held: VecDeque<HeldConnection>,
    next_token: usize,
    scratch: Vec<u8>,
}

impl Gate {
    /// Bind the rule's listening address
    pub fn bind(
        rule: RuleId,
        config: &ForwardRule,
        store: Arc<AuthorizationStore>,
        metrics: Arc<Metrics>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Gate {
            rule,
            forward_addr: config.forward_addr,
            drop_delay: config.drop_delay,
            max_connections: config.max_connections,
            poll,
            listener: Some(listener),
            local_addr,
            waker,
            store,
            metrics,
            sessions: HashMap::new(),
            routes: HashMap::new(),
            held: VecDeque::new(),
            next_token: FIRST_STREAM_TOKEN,
            scratch: vec![0u8; SCRATCH_SIZE],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and proxy until shutdown, then drain existing pairs
    pub fn run(mut self, shutdown: &Shutdown) -> io::Result<()> {
        shutdown.register_waker(Arc::clone(&self.waker))?;
        let mut events = Events::with_capacity(1024);

        log::info!(
            "forwarding {} -> {}, drop delay {:?}",
            self.local_addr,
            self.forward_addr,
            self.drop_delay
        );

        loop {
            if shutdown.is_triggered() && self.listener.is_some() {
                self.stop_accepting()?;
            }
            if self.listener.is_none() && self.sessions.is_empty() {
                log::debug!("gate {} stopped", self.local_addr);
                return Ok(());
            }

            // Wake for the earliest held connection
            let timeout = self
                .held
                .front()
                .map(|h| h.deadline.saturating_duration_since(Instant::now()));

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_pending(),
                    WAKER_TOKEN => {}
                    token => self.process_stream(token),
                }
            }

            self.release_held(Instant::now());
        }
    }

    fn stop_accepting(&mut self) -> io::Result<()> {
        if let Some(mut listener) = self.listener.take() {
            self.poll.registry().deregister(&mut listener)?;
        }
        if !self.held.is_empty() {
            log::debug!("releasing {} held connections on shutdown", self.held.len());
            self.held.clear();
        }
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            let (stream, peer) = match listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept on {} failed: {}", self.local_addr, e);
                    return;
                }
            };
            self.admit(stream, peer);
        }
    }

    /// Decide a freshly accepted connection
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let decision = self.store.decide(self.rule, peer.ip());
        if !decision.is_admitted() {
            self.metrics
                .connections_dropped_total
                .fetch_add(1, Ordering::Relaxed);
            self.refuse(stream, peer);
            return;
        }

        if let Some(max) = self.max_connections {
            if self.sessions.len() >= max as usize {
                self.metrics
                    .connections_limited_total
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "connection from {} to {} refused, limit of {} reached",
                    peer,
                    self.local_addr,
                    max
                );
                return;
            }
        }

        log::debug!("{} admitted to {} ({:?})", peer, self.local_addr, decision);

        if let Err(e) = set_keepalive(&stream) {
            log::debug!("set keep-alive for {} failed: {}", peer, e);
        }

        let backend = match TcpStream::connect(self.forward_addr) {
            Ok(s) => s,
            Err(e) => {
                self.metrics.dial_failures_total.fetch_add(1, Ordering::Relaxed);
                log::warn!("dial {} for {} failed: {}", self.forward_addr, peer, e);
                return;
            }
        };

        if let Err(e) = self.open_session(stream, backend, peer) {
            log::warn!("register connection from {} failed: {}", peer, e);
        }
    }

    /// Drop now, or hold until the drop delay passes
    fn refuse(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.drop_delay.is_zero() {
            log::info!("unauthorized connection from {} to {} dropped", peer, self.local_addr);
            return;
        }
        log::info!(
            "unauthorized connection from {} to {}, dropping in {:?}",
            peer,
            self.local_addr,
            self.drop_delay
        );
        self.held.push_back(HeldConnection {
            _stream: stream,
            peer,
            deadline: Instant::now() + self.drop_delay,
        });
    }

    fn release_held(&mut self, now: Instant) {
        while self.held.front().is_some_and(|h| h.deadline <= now) {
            if let Some(held) = self.held.pop_front() {
                log::debug!("held connection from {} dropped", held.peer);
            }
        }
    }

    fn open_session(
        &mut self,
        mut client: TcpStream,
        mut backend: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let client_token = Token(self.next_token);
        let backend_token = Token(self.next_token + 1);
        self.next_token += 2;

        let registry = self.poll.registry();
        let interest = Interest::READABLE | Interest::WRITABLE;
        registry.register(&mut client, client_token, interest)?;
        if let Err(e) = registry.register(&mut backend, backend_token, interest) {
            let _ = registry.deregister(&mut client);
            return Err(e);
        }

        self.routes.insert(client_token, client_token);
        self.routes.insert(backend_token, client_token);
        self.sessions.insert(
            client_token,
            Session {
                client,
                backend,
                client_token,
                backend_token,
                peer,
                connected: false,
                closing: false,
                upstream: Vec::new(),
                downstream: Vec::new(),
            },
        );

        self.metrics
            .connections_admitted_total
            .fetch_add(1, Ordering::Relaxed);
        self.metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn process_stream(&mut self, token: Token) {
        let Some(&key) = self.routes.get(&token) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };

        if !session.connected {
            match session.check_connected() {
                Ok(true) => {
                    session.connected = true;
                    log::debug!("{} connected to {}", session.peer, self.forward_addr);
                }
                Ok(false) => return,
                Err(e) => {
                    self.metrics.dial_failures_total.fetch_add(1, Ordering::Relaxed);
                    log::warn!("dial {} for {} failed: {}", self.forward_addr, session.peer, e);
                    self.close_session(key);
                    return;
                }
            }
        }

        match session.pump(&mut self.scratch, &self.metrics) {
            Ok(Pump::Pending) => {}
            Ok(Pump::Done) => {
                log::debug!("connection from {} closed", session.peer);
                self.close_session(key);
            }
            Err(e) => {
                log::debug!("connection from {} ended: {}", session.peer, e);
                self.close_session(key);
            }
        }
    }

    fn close_session(&mut self, key: Token) {
        let Some(mut session) = self.sessions.remove(&key) else {
            return;
        };
        self.routes.remove(&session.client_token);
        self.routes.remove(&session.backend_token);

        let registry = self.poll.registry();
        let _ = registry.deregister(&mut session.client);
        let _ = registry.deregister(&mut session.backend);
        self.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
