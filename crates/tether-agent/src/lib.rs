//! tether-agent: the dialing side of tether
//!
//! The agent connects out to a listener over TLS, authenticates, and then
//! executes the commands it is sent one at a time: shell commands, file
//! transfers and interactive shells. When the connection ends it dials
//! again with exponential backoff.

pub mod error;
pub mod pty;
pub mod session;
pub mod state;
pub mod tunnel;

pub use error::AgentError;
pub use session::{serve, SessionConfig};
pub use state::{AgentState, ConnectionState};
