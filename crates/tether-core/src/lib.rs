//! tether-core: Core abstractions, configuration and authentication for tether
//!
//! This crate provides the error taxonomy, configuration structures, TLS
//! setup and the connection handshake shared by the listener and the agent.

pub mod auth;
pub mod config;
pub mod error;
pub mod time;
pub mod tls;
pub mod traits;

pub use auth::{agent_handshake, listener_handshake, AuthContext};
pub use error::{AuthError, ConfigError, ConnectionError, SessionError, TetherError, TransferError};
pub use traits::{BoxedTransport, Connected, Connector, Transport};
