//! Pseudo-terminal support for interactive shells

mod manager;

pub use manager::{spawn_reader, PtyProcess};
