//! Periodic handshake sender
//!
//! Each configured `(token, port)` entry owns one [`AuthSender`], ticked on
//! a fixed interval by [`knock_core::spawn_periodic`]. A failed send is
//! never retried early; only the warning log is throttled.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::net::UdpSocket;

use knock_core::{AuthCodec, CodecError, HandshakeRequest, Tick};

use crate::metrics::Metrics;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum SendError {
    /// Server address could not be resolved
    Resolve { addr: String, source: io::Error },
    /// Server address resolved to nothing
    NoAddress(String),
    /// Request could not be sealed
    Seal(CodecError),
    /// Socket bind, connect or send failed
    Socket(io::Error),
    /// Datagram only partly sent
    Short { sent: usize, len: usize },
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Resolve { addr, source } => {
                write!(f, "cannot resolve address {}: {}", addr, source)
            }
            SendError::NoAddress(addr) => write!(f, "address {} resolved to nothing", addr),
            SendError::Seal(e) => write!(f, "encrypt failed: {}", e),
            SendError::Socket(e) => write!(f, "write to server failed: {}", e),
            SendError::Short { sent, len } => write!(f, "sent {} of {} bytes", sent, len),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Resolve { source, .. } => Some(source),
            SendError::Seal(e) => Some(e),
            SendError::Socket(e) => Some(e),
            SendError::NoAddress(_) | SendError::Short { .. } => None,
        }
    }
}

// ============================================================================
// Failure Throttle
// ============================================================================

/// Consecutive failure counter that raises an alarm at 1, 10, 100, …
/// failures, and starts over after a success.
#[derive(Debug)]
pub struct FailureThrottle {
    failures: u64,
    next_alarm: u64,
}

impl FailureThrottle {
    pub fn new() -> Self {
        FailureThrottle {
            failures: 0,
            next_alarm: 1,
        }
    }

    /// Count a failure. Returns the streak length when it reaches an alarm
    /// threshold.
    pub fn record_failure(&mut self) -> Option<u64> {
        self.failures += 1;
        if self.failures >= self.next_alarm {
            self.next_alarm = self.next_alarm.saturating_mul(10);
            Some(self.failures)
        } else {
            None
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.next_alarm = 1;
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl Default for FailureThrottle {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Sender
// ============================================================================

pub struct AuthSender {
    /// Server auth address, resolved on every send
    addr: String,
    codec: Arc<AuthCodec>,
    token: String,
    port: u16,
    throttle: FailureThrottle,
    metrics: Arc<Metrics>,
}

impl AuthSender {
    pub fn new(
        addr: impl Into<String>,
        codec: Arc<AuthCodec>,
        token: impl Into<String>,
        port: u16,
        metrics: Arc<Metrics>,
    ) -> Self {
        AuthSender {
            addr: addr.into(),
            codec,
            token: token.into(),
            port,
            throttle: FailureThrottle::new(),
            metrics,
        }
    }

    /// Send one fresh handshake. Returns the datagram length.
    pub fn send_once(&self) -> Result<usize, SendError> {
        let dest = self
            .addr
            .to_socket_addrs()
            .map_err(|source| SendError::Resolve {
                addr: self.addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| SendError::NoAddress(self.addr.clone()))?;

        let mut request = HandshakeRequest::new(self.token.clone(), self.port);
        let datagram = self.codec.seal_request(&mut request).map_err(SendError::Seal)?;

        let local = match dest {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local).map_err(SendError::Socket)?;
        socket.connect(dest).map_err(SendError::Socket)?;
        let sent = socket.send(&datagram).map_err(SendError::Socket)?;
        if sent != datagram.len() {
            return Err(SendError::Short {
                sent,
                len: datagram.len(),
            });
        }
        Ok(sent)
    }

    /// One scheduled round: validate, send, account
    pub fn tick(&mut self) -> Tick {
        if !HandshakeRequest::new(self.token.clone(), self.port).is_valid() {
            log::warn!(
                "request invalid, stop auth for port {} with token {}",
                self.port,
                self.token
            );
            return Tick::Stop;
        }

        match self.send_once() {
            Ok(_) => {
                self.metrics.handshakes_sent_total.fetch_add(1, Ordering::Relaxed);
                log::debug!("auth port {} with token {} success", self.port, self.token);
                self.throttle.record_success();
            }
            Err(e) => {
                self.metrics
                    .handshake_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                log::info!("auth failed: {}", e);
                if let Some(streak) = self.throttle.record_failure() {
                    log::warn!(
                        "[{:4}]auth to port {} with token {} failed: {}",
                        streak,
                        self.port,
                        self.token,
                        e
                    );
                }
            }
        }
        Tick::Continue
    }
}
