//! Port-knocking gateway server
//!
//! Receives encrypted UDP handshakes, turns accepted ones into per-rule
//! grants, and forwards TCP connections only from sources holding a grant
//! or matching a static allow rule.

pub mod config;
pub mod gate;
pub mod handler;
pub mod listener;
pub mod metrics;
pub mod server;

pub use config::{ServerConfig, ServerSettings};
pub use handler::{AuthHandler, Outcome, Rejection};
pub use metrics::Metrics;
pub use server::{Server, ServerError};
