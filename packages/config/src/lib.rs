// ABOUTME: Configuration and environment variable management for Skiff
// ABOUTME: Shared by the transport and sandbox crates

pub mod client;
pub mod constants;

pub use client::{ClientConfig, ConfigError};
pub use constants::{ENVD_PORT, INTERPRETER_PORT};
