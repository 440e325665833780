//! Event pipeline configuration and flag parsing.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Output sink type constants.
pub const OUTPUT_TYPE_STDOUT: &str = "stdout";
pub const OUTPUT_TYPE_HTTP: &str = "http";
pub const OUTPUT_TYPE_XATU: &str = "xatu";
pub const OUTPUT_TYPE_KAFKA: &str = "kafka";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("name is required when event publishing is enabled")]
    MissingName,
    #[error("at least one output is required when event publishing is enabled")]
    NoOutputs,
    #[error("output[{index}]: {source}")]
    Output {
        index: usize,
        source: OutputError,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputError {
    #[error("empty output flag")]
    Empty,
    #[error("invalid output format {0:?} (expected type:address or stdout)")]
    InvalidFormat(String),
    #[error("unknown output type {0:?} (valid: stdout, http, xatu, kafka)")]
    UnknownType(String),
    #[error("address is required for output type {0:?}")]
    MissingAddress(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("empty {0} flag")]
    Empty(&'static str),
    #[error("invalid {flag} format {value:?} (expected key=value)")]
    InvalidFormat { flag: &'static str, value: String },
    #[error("{0} key cannot be empty")]
    EmptyKey(&'static str),
}

/// A single output sink configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// `stdout`, `http`, `xatu` or `kafka`.
    pub kind: String,
    /// URL, host:port or brokers/topic depending on kind.
    pub address: String,
}

impl OutputConfig {
    pub fn validate(&self) -> Result<(), OutputError> {
        match self.kind.as_str() {
            OUTPUT_TYPE_STDOUT => Ok(()),
            OUTPUT_TYPE_HTTP | OUTPUT_TYPE_XATU | OUTPUT_TYPE_KAFKA => {
                if self.address.is_empty() {
                    Err(OutputError::MissingAddress(self.kind.clone()))
                } else {
                    Ok(())
                }
            }
            other => Err(OutputError::UnknownType(other.to_string())),
        }
    }
}

/// gRPC-style keep-alive settings for collector outputs.
#[derive(Debug, Clone, Default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub time: Option<Duration>,
    pub timeout: Option<Duration>,
}

/// Event pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct EventsConfig {
    /// Master switch; everything below is ignored when false.
    pub enabled: bool,

    /// Instance name carried in event client metadata.
    pub name: String,

    /// Custom key/value labels added to event metadata.
    pub labels: HashMap<String, String>,

    /// Where events are published.
    pub outputs: Vec<OutputConfig>,

    /// Enable TLS for collector outputs.
    pub tls: bool,

    /// Custom headers for http/collector outputs.
    pub headers: HashMap<String, String>,

    /// Maximum events buffered per sink before dropping. 0 = default.
    pub max_queue_size: usize,

    /// Maximum events per export batch. 0 = default.
    pub max_export_batch_size: usize,

    /// Concurrent export workers per sink. 0 = default.
    pub workers: usize,

    /// Wait before exporting a partial batch. None = default.
    pub batch_timeout: Option<Duration>,

    /// Timeout per export operation. None = default.
    pub export_timeout: Option<Duration>,

    pub keep_alive: KeepAliveConfig,

    /// JWT secret for the Engine API metadata fetch (file path or hex).
    pub jwt_secret: Option<String>,
}

impl EventsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }

        if self.outputs.is_empty() {
            return Err(ConfigError::NoOutputs);
        }

        for (index, output) in self.outputs.iter().enumerate() {
            output
                .validate()
                .map_err(|source| ConfigError::Output { index, source })?;
        }

        Ok(())
    }
}

/// Parse an output flag value in `type:address` or bare `stdout` form.
///
/// Examples:
/// - `stdout` -> `{kind: "stdout", address: ""}`
/// - `http:https://example.com` -> `{kind: "http", address: "https://example.com"}`
/// - `xatu:xatu.example.com:8080` -> `{kind: "xatu", address: "xatu.example.com:8080"}`
pub fn parse_output_flag(s: &str) -> Result<OutputConfig, OutputError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(OutputError::Empty);
    }

    if s == OUTPUT_TYPE_STDOUT {
        return Ok(OutputConfig {
            kind: OUTPUT_TYPE_STDOUT.to_string(),
            address: String::new(),
        });
    }

    let Some((kind, address)) = s.split_once(':') else {
        return Err(OutputError::InvalidFormat(s.to_string()));
    };

    Ok(OutputConfig {
        kind: kind.to_string(),
        address: address.to_string(),
    })
}

/// Parse a label flag value in `key=value` form.
pub fn parse_label_flag(s: &str) -> Result<(String, String), FlagError> {
    parse_key_value_flag(s, "label")
}

/// Parse a header flag value in `name=value` form.
pub fn parse_header_flag(s: &str) -> Result<(String, String), FlagError> {
    parse_key_value_flag(s, "header")
}

fn parse_key_value_flag(s: &str, flag: &'static str) -> Result<(String, String), FlagError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FlagError::Empty(flag));
    }

    let Some((key, value)) = s.split_once('=') else {
        return Err(FlagError::InvalidFormat {
            flag,
            value: s.to_string(),
        });
    };

    if key.is_empty() {
        return Err(FlagError::EmptyKey(flag));
    }

    Ok((key.to_string(), value.to_string()))
}
