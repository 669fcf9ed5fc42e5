//! Gantry Core
//!
//! Core domain types, traits, and error handling for the Gantry pipeline
//! orchestration engine. This crate has minimal dependencies and defines the
//! shared vocabulary used across all other crates.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod pipeline;
pub mod ports;
pub mod rules;
pub mod variables;

pub use error::{Error, FailureReason, Result};
pub use ids::*;
