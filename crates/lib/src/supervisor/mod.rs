//! Session-scoped process supervision.
//!
//! Each session owns at most one running command tree. Starting a command, halting, or
//! disconnecting evicts whatever the session owned before; eviction kills the whole tree.

mod pump;
mod registry;
mod runner;
pub mod tree;

pub use pump::StreamPump;
pub use registry::{ProcessRunner, Session, SessionRegistry};
pub use runner::{exit_code, run_captured, start, Captured, SpawnError};
