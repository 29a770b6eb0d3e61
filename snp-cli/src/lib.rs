//! SNP CLI Library
//!
//! Shared functionality for the SNP command-line tools.

pub mod config;
pub mod stats;

pub use config::{ClientCliConfig, Config, ConfigError, ServerCliConfig};
pub use stats::display_stats;
