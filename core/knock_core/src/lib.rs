//! Port-knocking gateway core
//!
//! Shared by the server and the client:
//! - [`codec`]: AES-256-GCM sealing of handshake datagrams
//! - [`request`]: the handshake payload
//! - [`replay`]: nonce replay cache
//! - [`pattern`], [`rule`], [`store`]: access policy and per-rule grants
//! - [`config`], [`shutdown`], [`host`], [`logging`]: process plumbing

pub mod codec;
pub mod config;
pub mod host;
pub mod logging;
pub mod pattern;
pub mod replay;
pub mod request;
pub mod rule;
pub mod shutdown;
pub mod store;

pub use codec::{AuthCodec, CodecError};
pub use config::ConfigError;
pub use pattern::{IpRule, RuleError, TokenPattern};
pub use replay::{Observation, ReplayCache};
pub use request::{unix_now, HandshakeRequest};
pub use rule::{ForwardRule, GlobalPolicy};
pub use shutdown::{spawn_periodic, Shutdown, Tick};
pub use store::{AuthorizationStore, Decision, RuleId};
