//! Process-wide shutdown signal and supervised periodic tasks
//!
//! Poll loops register a [`mio::Waker`] so a trigger interrupts their
//! `poll` immediately; periodic tasks sleep on the shutdown condition so
//! they exit within one tick.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::Waker;

// ============================================================================
// Shutdown
// ============================================================================

struct State {
    triggered: bool,
    wakers: Vec<Arc<Waker>>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Cloneable shutdown handle shared by every task
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    triggered: false,
                    wakers: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signal every task to stop. Idempotent.
    pub fn trigger(&self) {
        let wakers = {
            let mut state = self.lock();
            if state.triggered {
                return;
            }
            state.triggered = true;
            std::mem::take(&mut state.wakers)
        };
        self.inner.cond.notify_all();

        for waker in wakers {
            if let Err(e) = waker.wake() {
                log::debug!("Failed to wake poll loop on shutdown: {}", e);
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.lock().triggered
    }

    /// Wake `waker` when shutdown is triggered (immediately if it already was)
    pub fn register_waker(&self, waker: Arc<Waker>) -> io::Result<()> {
        let mut state = self.lock();
        if state.triggered {
            drop(state);
            return waker.wake();
        }
        state.wakers.push(waker);
        Ok(())
    }

    /// Block for up to `timeout`. Returns true if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Block until shutdown is triggered
    pub fn wait(&self) {
        let mut state = self.lock();
        while !state.triggered {
            state = self.inner.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Periodic Tasks
// ============================================================================

/// What a periodic task wants after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Stop,
}

/// Run `tick` now and then every `interval` on a named thread until it
/// returns [`Tick::Stop`] or `shutdown` is triggered.
///
/// The interval is fixed: a slow tick does not shift later ones, and ticks
/// missed during a stall are dropped rather than run back-to-back.
pub fn spawn_periodic<F>(
    name: &str,
    interval: Duration,
    shutdown: &Shutdown,
    mut tick: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnMut() -> Tick + Send + 'static,
{
    let shutdown = shutdown.clone();
    let task = name.to_string();

    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut next = Instant::now();
        loop {
            if shutdown.is_triggered() || tick() == Tick::Stop {
                break;
            }
            // Missed ticks are skipped, never replayed in a burst
            next = (next + interval).max(Instant::now());
            let wait = next.saturating_duration_since(Instant::now());
            if shutdown.wait_timeout(wait) {
                break;
            }
        }
        log::debug!("{} stopped", task);
    })
}
