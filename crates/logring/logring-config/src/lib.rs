mod config;

pub use config::{ConfigError, LogringConfig, OutputFormat};
