//! Dialing and redialing the listener

mod connector;
mod driver;
mod reconnect;

pub use connector::TlsConnector;
pub use driver::Driver;
pub use reconnect::ExponentialBackoff;
