//! Configuration module for reelwatch
//!
//! Handles loading configuration from TOML files, migrating legacy layouts,
//! environment variable overrides and one-shot validation.

pub mod config;
pub mod migrate;

pub use config::*;
pub use migrate::RawConfig;
