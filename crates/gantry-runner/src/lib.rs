//! Runner agents for Gantry.
//!
//! Currently ships the shell runner; container and cluster agents plug in
//! through the same `RunnerAgent` port.

pub mod local;

pub use local::LocalRunner;
