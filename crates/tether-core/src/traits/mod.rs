//! Core trait definitions

mod connection;

pub use connection::{BoxedTransport, Connected, Connector, Transport};
