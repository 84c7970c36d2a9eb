//! TLS server accepting agent connections

mod handler;
mod listener;

pub use handler::ConnectionHandler;
pub use listener::TlsServer;
