//! UDP handshake listener
//!
//! A mio poll loop draining the auth socket and handing each datagram to the
//! [`AuthHandler`]. Errors on one datagram never stop the loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};

use knock_core::Shutdown;

use crate::handler::AuthHandler;

// ============================================================================
// Constants
// ============================================================================

/// Largest handshake datagram read; anything longer is truncated and then
/// fails authentication
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// mio token for the shutdown waker
const WAKER_TOKEN: Token = Token(1);

// ============================================================================
// Listener
// ============================================================================

pub struct AuthListener {
    /// mio poll instance
    poll: Poll,
    /// UDP socket handshakes arrive on
    socket: UdpSocket,
    /// Wakes the poll loop on shutdown
    waker: Arc<Waker>,
    /// Validates and applies handshakes
    handler: AuthHandler,
    /// Receive buffer
    recv_buf: Vec<u8>,
}

impl AuthListener {
    /// Bind the auth socket and register it with a fresh poll instance
    pub fn bind(addr: SocketAddr, handler: AuthHandler) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(AuthListener {
            poll,
            socket,
            waker,
            handler,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive handshakes until `shutdown` is triggered
    pub fn run(mut self, shutdown: &Shutdown) -> io::Result<()> {
        shutdown.register_waker(Arc::clone(&self.waker))?;
        let mut events = Events::with_capacity(64);

        log::info!("waiting for auth by UDP, address {}", self.socket.local_addr()?);

        loop {
            if shutdown.is_triggered() {
                log::debug!("auth listener stopped");
                return Ok(());
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket();
                }
            }
        }
    }

    fn process_socket(&mut self) {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) => match drain_step(&e) {
                    DrainStep::Retry => continue,
                    DrainStep::Done => break,
                    DrainStep::Failed => {
                        log::warn!("read from auth socket failed: {}", e);
                        break;
                    }
                },
            };

            if len == 0 {
                continue;
            }

            log::trace!("Received {} bytes from {}", len, from);
            let outcome = self.handler.handle_datagram(&self.recv_buf[..len], from);
            log::debug!("Handshake from {}: {:?}", from, outcome);
        }
    }
}

/// What the drain loop does after a failed `recv_from`
#[derive(Debug, PartialEq, Eq)]
enum DrainStep {
    /// Interrupted, read again
    Retry,
    /// Socket drained, wait for readiness
    Done,
    /// Real error: log once and wait for the next readiness event, so a
    /// recurring error cannot spin the loop
    Failed,
}

fn drain_step(err: &io::Error) -> DrainStep {
    match err.kind() {
        io::ErrorKind::Interrupted => DrainStep::Retry,
        io::ErrorKind::WouldBlock => DrainStep::Done,
        _ => DrainStep::Failed,
    }
}
