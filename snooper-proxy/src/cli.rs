//! CLI surface.
//!
//! Every flag has a matching `SNOOPER_*` environment variable; explicit
//! CLI values override the environment. The target URL is positional or
//! `SNOOPER_TARGET`.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use snooper_core::events::config::{
    parse_header_flag, parse_label_flag, parse_output_flag, EventsConfig, KeepAliveConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "rpc-snooper",
    version,
    about = "Intercepting, observing reverse proxy for JSON-RPC traffic"
)]
pub struct Cli {
    /// Upstream target URL proxied requests are forwarded to
    /// (env: SNOOPER_TARGET).
    #[arg(value_name = "target-url", env = "SNOOPER_TARGET")]
    pub target: Option<String>,

    /// Address to bind to and listen for incoming requests
    /// (env: SNOOPER_BIND_ADDRESS).
    #[arg(short = 'b', long, default_value = "127.0.0.1", env = "SNOOPER_BIND_ADDRESS")]
    pub bind_address: String,

    /// Port to listen on for incoming requests (env: SNOOPER_PORT).
    #[arg(short = 'p', long, default_value_t = 3000, env = "SNOOPER_PORT")]
    pub port: u16,

    /// Run with verbose output (env: SNOOPER_VERBOSE).
    #[arg(short = 'v', long, env = "SNOOPER_VERBOSE")]
    pub verbose: bool,

    /// Do not use terminal colors in output (env: SNOOPER_NO_COLOR).
    #[arg(long, env = "SNOOPER_NO_COLOR")]
    pub no_color: bool,

    /// Do not provide the management REST API (env: SNOOPER_NO_API).
    #[arg(long, env = "SNOOPER_NO_API")]
    pub no_api: bool,

    /// Optional address to bind the standalone API server to
    /// (env: SNOOPER_API_BIND).
    #[arg(long, default_value = "0.0.0.0", env = "SNOOPER_API_BIND")]
    pub api_bind: String,

    /// Optional separate port for the API endpoints; 0 disables the
    /// standalone API server (env: SNOOPER_API_PORT).
    #[arg(long, default_value_t = 0, env = "SNOOPER_API_PORT")]
    pub api_port: u16,

    /// Optional API authentication, `user:pass[,user2:pass2]*`
    /// (env: SNOOPER_API_AUTH).
    #[arg(long, env = "SNOOPER_API_AUTH")]
    pub api_auth: Option<String>,

    /// Address to bind the Prometheus metrics endpoint to
    /// (env: SNOOPER_METRICS_BIND).
    #[arg(long, default_value = "127.0.0.1", env = "SNOOPER_METRICS_BIND")]
    pub metrics_bind: String,

    /// Optional port for the Prometheus metrics endpoint; 0 disables it
    /// (env: SNOOPER_METRICS_PORT).
    #[arg(long, default_value_t = 0, env = "SNOOPER_METRICS_PORT")]
    pub metrics_port: u16,

    /// Enable event publishing (env: SNOOPER_XATU_ENABLED).
    #[arg(long, env = "SNOOPER_XATU_ENABLED")]
    pub xatu_enabled: bool,

    /// Instance name for published events (env: SNOOPER_XATU_NAME).
    #[arg(long, default_value = "", env = "SNOOPER_XATU_NAME")]
    pub xatu_name: String,

    /// Event output sink, `type:address`, repeatable
    /// (env: SNOOPER_XATU_OUTPUTS, comma-separated).
    #[arg(long = "xatu-output", env = "SNOOPER_XATU_OUTPUTS", value_delimiter = ',')]
    pub xatu_outputs: Vec<String>,

    /// Event metadata label, `key=value`, repeatable
    /// (env: SNOOPER_XATU_LABELS, comma-separated).
    #[arg(long = "xatu-label", env = "SNOOPER_XATU_LABELS", value_delimiter = ',')]
    pub xatu_labels: Vec<String>,

    /// Enable TLS for collector outputs (env: SNOOPER_XATU_TLS).
    #[arg(long, env = "SNOOPER_XATU_TLS")]
    pub xatu_tls: bool,

    /// Output header, `name=value`, repeatable
    /// (env: SNOOPER_XATU_HEADERS, comma-separated).
    #[arg(long = "xatu-header", env = "SNOOPER_XATU_HEADERS", value_delimiter = ',')]
    pub xatu_headers: Vec<String>,

    /// Max events buffered per sink before dropping; 0 for the default
    /// (env: SNOOPER_XATU_MAX_QUEUE_SIZE).
    #[arg(long, default_value_t = 0, env = "SNOOPER_XATU_MAX_QUEUE_SIZE")]
    pub xatu_max_queue_size: usize,

    /// Max events per export batch; 0 for the default
    /// (env: SNOOPER_XATU_MAX_EXPORT_BATCH_SIZE).
    #[arg(long, default_value_t = 0, env = "SNOOPER_XATU_MAX_EXPORT_BATCH_SIZE")]
    pub xatu_max_export_batch_size: usize,

    /// Concurrent export workers per sink; 0 for the default
    /// (env: SNOOPER_XATU_WORKERS).
    #[arg(long, default_value_t = 0, env = "SNOOPER_XATU_WORKERS")]
    pub xatu_workers: usize,

    /// Wait before exporting a partial batch, e.g. `5s`
    /// (env: SNOOPER_XATU_BATCH_TIMEOUT).
    #[arg(long, value_parser = parse_duration, env = "SNOOPER_XATU_BATCH_TIMEOUT")]
    pub xatu_batch_timeout: Option<Duration>,

    /// Timeout per export operation, e.g. `30s`
    /// (env: SNOOPER_XATU_EXPORT_TIMEOUT).
    #[arg(long, value_parser = parse_duration, env = "SNOOPER_XATU_EXPORT_TIMEOUT")]
    pub xatu_export_timeout: Option<Duration>,

    /// Enable keep-alive for collector outputs
    /// (env: SNOOPER_XATU_KEEPALIVE_ENABLED).
    #[arg(long, env = "SNOOPER_XATU_KEEPALIVE_ENABLED")]
    pub xatu_keepalive_enabled: bool,

    /// Interval between keep-alive pings, e.g. `30s`
    /// (env: SNOOPER_XATU_KEEPALIVE_TIME).
    #[arg(long, value_parser = parse_duration, env = "SNOOPER_XATU_KEEPALIVE_TIME")]
    pub xatu_keepalive_time: Option<Duration>,

    /// Wait for a keep-alive response, e.g. `10s`
    /// (env: SNOOPER_XATU_KEEPALIVE_TIMEOUT).
    #[arg(long, value_parser = parse_duration, env = "SNOOPER_XATU_KEEPALIVE_TIMEOUT")]
    pub xatu_keepalive_timeout: Option<Duration>,

    /// JWT secret for the Engine API metadata fetch: a hex string or a
    /// path to a hex-encoded secret file (env: SNOOPER_XATU_JWT_SECRET).
    #[arg(long, env = "SNOOPER_XATU_JWT_SECRET")]
    pub xatu_jwt_secret: Option<String>,
}

impl Cli {
    /// Assemble the event pipeline config from the flags. Invalid
    /// repeatable entries are skipped with a warning, matching the
    /// lenient flag handling of the rest of the CLI.
    pub fn events_config(&self) -> EventsConfig {
        if !self.xatu_enabled {
            return EventsConfig::default();
        }

        let mut outputs = Vec::with_capacity(self.xatu_outputs.len());
        for raw in &self.xatu_outputs {
            match parse_output_flag(raw) {
                Ok(output) => outputs.push(output),
                Err(err) => warn!(output = %raw, error = %err, "invalid xatu output"),
            }
        }

        let mut labels = HashMap::new();
        for raw in &self.xatu_labels {
            match parse_label_flag(raw) {
                Ok((key, value)) => {
                    labels.insert(key, value);
                }
                Err(err) => warn!(label = %raw, error = %err, "invalid xatu label"),
            }
        }

        let mut headers = HashMap::new();
        for raw in &self.xatu_headers {
            match parse_header_flag(raw) {
                Ok((name, value)) => {
                    headers.insert(name, value);
                }
                Err(err) => warn!(header = %raw, error = %err, "invalid xatu header"),
            }
        }

        EventsConfig {
            enabled: true,
            name: self.xatu_name.clone(),
            labels,
            outputs,
            tls: self.xatu_tls,
            headers,
            max_queue_size: self.xatu_max_queue_size,
            max_export_batch_size: self.xatu_max_export_batch_size,
            workers: self.xatu_workers,
            batch_timeout: self.xatu_batch_timeout,
            export_timeout: self.xatu_export_timeout,
            keep_alive: KeepAliveConfig {
                enabled: self.xatu_keepalive_enabled,
                time: self.xatu_keepalive_time,
                timeout: self.xatu_keepalive_timeout,
            },
            jwt_secret: self.xatu_jwt_secret.clone(),
        }
    }
}

/// Parse a duration flag: a number with an optional `ms`, `s`, `m` or
/// `h` suffix. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (value, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, "s"),
    };

    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration value {s:?}"))?;

    if value < 0.0 {
        return Err(format!("negative duration {s:?}"));
    }

    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?}")),
    };

    Ok(Duration::from_secs_f64(seconds))
}
