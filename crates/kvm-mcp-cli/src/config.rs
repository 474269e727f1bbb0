//! Configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SHKVM_API_HOST` | `127.0.0.1` |
//! | `SHKVM_API_PORT` | `9329` |
//! | `SHKVM_TIMEOUT_MS` | `10000` |
//! | `SHKVM_CONNECT_TIMEOUT_MS` | `3000` |
//! | `MCP_TESSERACT_CMD` | search `PATH` |
//! | `MCP_CAPTURE_LOG_DIR` | `<data-local-dir>/kvm-mcp/captures` |
//!
//! Empty values fall back to the default, except `MCP_CAPTURE_LOG_DIR`
//! where an empty value turns the capture log off.

use std::env;
use std::num::{NonZeroU16, NonZeroU64};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::service::Timeouts;

pub const HOST_VAR: &str = "SHKVM_API_HOST";
pub const PORT_VAR: &str = "SHKVM_API_PORT";
pub const TIMEOUT_VAR: &str = "SHKVM_TIMEOUT_MS";
pub const CONNECT_TIMEOUT_VAR: &str = "SHKVM_CONNECT_TIMEOUT_MS";
pub const TESSERACT_VAR: &str = "MCP_TESSERACT_CMD";
pub const CAPTURE_LOG_VAR: &str = "MCP_CAPTURE_LOG_DIR";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9329;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}='{value}' is not a valid {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Resolved startup configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub tesseract_cmd: Option<PathBuf>,
    pub capture_log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = non_empty(HOST_VAR).unwrap_or_else(|| DEFAULT_HOST.to_string());
        // Zero is not a usable port or timeout
        let port = parse_var::<NonZeroU16>(PORT_VAR, "port number")?
            .map_or(DEFAULT_PORT, NonZeroU16::get);
        let timeout_ms = parse_var::<NonZeroU64>(TIMEOUT_VAR, "positive millisecond count")?
            .map_or(DEFAULT_TIMEOUT_MS, NonZeroU64::get);
        let connect_timeout_ms =
            parse_var::<NonZeroU64>(CONNECT_TIMEOUT_VAR, "positive millisecond count")?
                .map_or(DEFAULT_CONNECT_TIMEOUT_MS, NonZeroU64::get);

        Ok(Self {
            host,
            port,
            request_timeout: Duration::from_millis(timeout_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            tesseract_cmd: non_empty(TESSERACT_VAR).map(PathBuf::from),
            capture_log_dir: capture_log_dir(),
        })
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn service_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            request: self.request_timeout,
            connect: self.connect_timeout,
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(var: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError> {
    match non_empty(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected,
            }),
    }
}

/// Capture log directory.
///
/// Priority:
/// 1. `MCP_CAPTURE_LOG_DIR` (empty string disables logging)
/// 2. `<data-local-dir>/kvm-mcp/captures`
fn capture_log_dir() -> Option<PathBuf> {
    match env::var_os(CAPTURE_LOG_VAR) {
        Some(dir) if dir.is_empty() => None,
        Some(dir) => Some(PathBuf::from(dir)),
        None => dirs::data_local_dir().map(|d| d.join("kvm-mcp").join("captures")),
    }
}
