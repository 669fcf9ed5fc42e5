//! Integration test infrastructure for Gantry.
//!
//! Provides an in-process `TestContext` wiring the engine to in-memory
//! stores, a scripted runner agent, and fixture builders for pipeline
//! configurations.

pub mod context;
pub mod fixtures;
pub mod runner;

pub use context::TestContext;
pub use runner::{FakeRunner, Plan};

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
