//! Image Squash Core - Foundational Types
//!
//! Error taxonomy and configuration shared by the squash runtime and CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{LogLevel, OutputCompression, RegistryConfig, SquashConfig};
pub use error::{Result, SquashError, Stage};

/// Image Squash version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
