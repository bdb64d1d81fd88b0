//! Environment-driven configuration. Parsing a config *file* is out of
//! scope; `dotenvy` loads a local `.env` during development the same way
//! the values would be set in a real deployment's environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::token::TokenFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Full zeromq endpoint, e.g. `tcp://127.0.0.1:5555`.
    pub control_bind: String,
    pub sqlite_path: PathBuf,
    pub cacerts_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub device_token_format: TokenFormat,
    pub push_gateway: (String, u16),
    pub push_concurrency: usize,
    pub push_max_notification_lag: i64,
    pub push_max_error_wait: f64,
    pub feedback_gateway: (String, u16),
    pub feedback_frequency: Duration,
    pub log_format: LogFormat,
    pub metrics_bind: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let control_bind = required("RELAY_CONTROL_BIND")?;
        let sqlite_path = PathBuf::from(required("RELAY_SQLITE_PATH")?);
        let cacerts_file = PathBuf::from(required("RELAY_CACERTS_FILE")?);
        let cert_file = PathBuf::from(required("RELAY_CERT_FILE")?);
        let key_file = PathBuf::from(required("RELAY_KEY_FILE")?);

        let format_str = required("RELAY_DEVICE_TOKEN_FORMAT")?;
        let device_token_format =
            TokenFormat::parse(&format_str).ok_or_else(|| ConfigError::UnknownTokenFormat(format_str.clone()))?;

        let push_gateway = parse_host_port(&required("RELAY_PUSH_GATEWAY")?, "RELAY_PUSH_GATEWAY")?;
        let push_concurrency: usize = parse_num("RELAY_PUSH_CONCURRENCY")?;
        let push_max_notification_lag: i64 = parse_num("RELAY_PUSH_MAX_NOTIFICATION_LAG")?;
        let push_max_error_wait: f64 = parse_num("RELAY_PUSH_MAX_ERROR_WAIT")?;

        let feedback_gateway = parse_host_port(&required("RELAY_FEEDBACK_GATEWAY")?, "RELAY_FEEDBACK_GATEWAY")?;
        let feedback_frequency_secs: u64 = parse_num("RELAY_FEEDBACK_FREQUENCY")?;

        let log_format = match std::env::var("RELAY_LOG_FORMAT").ok().as_deref() {
            Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            _ if cfg!(debug_assertions) => LogFormat::Pretty,
            _ => LogFormat::Json,
        };

        let metrics_bind = std::env::var("RELAY_METRICS_BIND").ok().filter(|s| !s.is_empty());

        Ok(Self {
            control_bind,
            sqlite_path,
            cacerts_file,
            cert_file,
            key_file,
            device_token_format,
            push_gateway,
            push_concurrency,
            push_max_notification_lag,
            push_max_error_wait,
            feedback_gateway,
            feedback_frequency: Duration::from_secs(feedback_frequency_secs),
            log_format,
            metrics_bind,
        })
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingVar(key.to_string()))
}

fn parse_num<T: std::str::FromStr>(key: &str) -> Result<T, ConfigError> {
    let raw = required(key)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: raw })
}

fn parse_host_port(s: &str, key: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidValue { key: key.to_string(), value: s.to_string() })?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: s.to_string() })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        assert_eq!(
            parse_host_port("gateway.push.example:2195", "X").unwrap(),
            ("gateway.push.example".to_string(), 2195)
        );
    }

    #[test]
    fn rejects_host_port_without_colon() {
        assert!(parse_host_port("gateway.push.example", "X").is_err());
    }
}
