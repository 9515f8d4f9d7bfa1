//! Server configuration loaded from a TOML file.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration for the demo HTTP server binary.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server name used in connection names and logs.
    #[serde(default = "default_name")]
    pub name: String,

    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Enable SO_REUSEPORT on the listening socket.
    #[serde(default)]
    pub reuse_port: bool,

    /// Worker event-loop threads (default: number of CPUs; 0 runs
    /// everything on the main loop).
    pub worker_threads: Option<usize>,

    /// Enable TCP_NODELAY on accepted connections.
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// Output-buffer backpressure threshold (e.g. "64MB").
    #[serde(
        default = "default_high_water_mark",
        deserialize_with = "deserialize_size"
    )]
    pub high_water_mark: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: default_name(),
            listen: default_listen(),
            reuse_port: false,
            worker_threads: None,
            tcp_nodelay: true,
            high_water_mark: default_high_water_mark(),
            logging: LoggingConfig::default(),
        }
    }
}

/// The `[logging]` section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "pretty", "compact", or "json".
    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(threads) = self.worker_threads {
            if threads > 1024 {
                return Err(Error::Config(format!(
                    "worker_threads ({}) is unreasonably large",
                    threads
                )));
            }
        }
        if self.high_water_mark == 0 {
            return Err(Error::Config("high_water_mark must be non-zero".into()));
        }
        Ok(())
    }

    /// Worker thread count, defaulting to the number of CPUs.
    pub fn threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get)
    }
}

fn default_name() -> String {
    "kiln".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_true() -> bool {
    true
}

fn default_high_water_mark() -> usize {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Deserialize a size given either as a number of bytes or as a string like
/// "64MB".
fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB" or "4GB" into bytes.
pub fn parse_size(s: &str) -> std::result::Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (number, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let number: usize = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", number))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_handles_suffixes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("64MB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("64XB").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn config_parses_from_toml() {
        let config: Config = toml::from_str(
            r#"
            name = "edge"
            listen = "127.0.0.1:9000"
            reuse_port = true
            worker_threads = 4
            high_water_mark = "1MB"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "edge");
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert!(config.reuse_port);
        assert_eq!(config.threads(), 4);
        assert_eq!(config.high_water_mark, 1024 * 1024);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: std::result::Result<Config, _> = toml::from_str("does_not_exist = 1");
        assert!(parsed.is_err());
    }

    #[test]
    fn zero_high_water_mark_fails_validation() {
        let config: Config = toml::from_str("high_water_mark = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
