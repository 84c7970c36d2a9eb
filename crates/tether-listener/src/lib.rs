//! tether-listener: accepts agent connections and drives them
//!
//! Agents dial in over TLS and authenticate ([`server`]); each admitted
//! connection becomes a [`session::Session`] tracked by the
//! [`SessionRegistry`]. The operator drives sessions from the [`console`]:
//! single commands through the command/response exchange, file copies
//! through [`transfer`], and interactive shells through the PTY bridge.

pub mod console;
pub mod server;
pub mod session;
pub mod state;
pub mod transfer;

pub use session::{Exchange, PtyBridge, Response, SessionRegistry};
pub use state::ListenerState;
