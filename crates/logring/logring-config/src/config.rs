use logring_core::{LayoutError, RingConfig};
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogringConfig {
    /// log2 of the number of descriptors.
    #[serde(default = "defaults::desc_count_bits")]
    pub desc_count_bits: u32,
    /// log2 of the average text bytes per record.
    #[serde(default = "defaults::avg_text_bits")]
    pub avg_text_bits: u32,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::writers")]
    pub writers: usize,
    #[serde(default = "defaults::messages_per_writer")]
    pub messages_per_writer: u64,
    #[serde(default)]
    pub output: OutputFormat,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid ring geometry")]
    Geometry(#[from] LayoutError),
}

mod defaults {
    pub fn desc_count_bits() -> u32 {
        15 // 32768 records
    }

    pub fn avg_text_bits() -> u32 {
        5 // 1 MiB of text
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn writers() -> usize {
        4
    }

    pub fn messages_per_writer() -> u64 {
        100_000
    }
}

impl Default for LogringConfig {
    fn default() -> Self {
        Self {
            desc_count_bits: defaults::desc_count_bits(),
            avg_text_bits: defaults::avg_text_bits(),
            log_level: defaults::log_level(),
            writers: defaults::writers(),
            messages_per_writer: defaults::messages_per_writer(),
            output: OutputFormat::default(),
        }
    }
}

impl LogringConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: LogringConfig = toml::from_str(toml_str)?;
        config.ring_config()?;
        Ok(config)
    }

    pub fn ring_config(&self) -> Result<RingConfig, ConfigError> {
        Ok(RingConfig::new(self.desc_count_bits, self.avg_text_bits)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = LogringConfig::parse("").unwrap();
        assert_eq!(cfg, LogringConfig::default());
        assert_eq!(cfg.ring_config().unwrap().text_size(), 1 << 20);
    }

    #[test]
    fn fields_override_defaults() {
        let cfg = LogringConfig::parse(
            r#"
            desc_count_bits = 10
            avg_text_bits = 6
            log_level = "debug"
            writers = 2
            output = "json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.desc_count_bits, 10);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.writers, 2);
        assert_eq!(cfg.messages_per_writer, 100_000);
        assert_eq!(cfg.output, OutputFormat::Json);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let err = LogringConfig::parse("desc_count_bits = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Geometry(LayoutError::Bits { .. })));
    }

    #[test]
    fn unknown_output_format_is_a_parse_error() {
        let err = LogringConfig::parse(r#"output = "xml""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = LogringConfig::load("/nonexistent/logring.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/logring.toml"));
    }
}
