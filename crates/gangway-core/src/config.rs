//! Server configuration resolution.
//!
//! Callers supply a partial [`ServerOptions`] tree (typically deserialized by
//! whatever configuration system embeds the toolkit); `resolve` merges it
//! over the built-in defaults and validates every value up front. The
//! resolved [`ServerConfig`] is immutable for the lifetime of a server.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_ADDRESS, DEFAULT_LOG_PREFIX, DEFAULT_PORT, DEFAULT_TIMEOUT, DEFAULT_VERBOSITY,
    DEFAULT_WORKERS,
};
use crate::error::{Error, Result};
use crate::logging::LogFormat;

// =============================================================================
// Options (caller-supplied, partial)
// =============================================================================

/// Caller-supplied server options. Every field is optional; unset fields
/// fall back to the defaults in [`crate::constants`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerOptions {
    /// Bind host.
    pub address: Option<String>,
    /// Bind port.
    pub port: Option<u16>,
    /// Worker pool capacity.
    pub workers: Option<usize>,
    /// Connection timeout as a duration string, e.g. "5s" or "1500ms".
    pub timeout: Option<String>,
    /// Transport kind ("tcp").
    pub transport: Option<String>,
    /// Logger sub-tree.
    pub logger: Option<LoggerOptions>,
}

/// Caller-supplied logger options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerOptions {
    /// Filter target prefix for log output.
    pub prefix: Option<String>,
    /// Verbosity level (0=error, 1=warn, 2=info, 3=debug, 4+=trace).
    pub verbosity: Option<u8>,
    /// Output format ("text" or "json").
    pub format: Option<String>,
    /// Optional log file path; stderr when unset.
    pub file: Option<PathBuf>,
}

impl ServerOptions {
    /// Merge these options over the defaults and validate the result.
    ///
    /// Fails with a configuration error on a malformed timeout, a zero-sized
    /// worker pool, an unknown transport kind, or an unknown log format.
    pub fn resolve(&self) -> Result<ServerConfig> {
        let timeout_raw = self.timeout.as_deref().unwrap_or(DEFAULT_TIMEOUT);
        let timeout = parse_duration(timeout_raw)?;
        if timeout.is_zero() {
            return Err(Error::Config {
                message: format!("timeout must be positive, got {:?}", timeout_raw),
            });
        }

        let workers = self.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(Error::Config {
                message: "workers must be at least 1".into(),
            });
        }

        let transport = match self.transport.as_deref() {
            None | Some("tcp") => TransportKind::Tcp,
            Some(other) => {
                return Err(Error::Config {
                    message: format!("unknown transport kind: {}", other),
                })
            }
        };

        let logger = self.logger.clone().unwrap_or_default().resolve()?;

        Ok(ServerConfig {
            address: self.address.clone().unwrap_or_else(|| DEFAULT_ADDRESS.into()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            workers,
            timeout,
            transport,
            logger,
        })
    }
}

impl LoggerOptions {
    fn resolve(&self) -> Result<LoggerConfig> {
        let format = match self.format.as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(Error::Config {
                    message: format!("unknown log format: {}", other),
                })
            }
        };

        Ok(LoggerConfig {
            prefix: self
                .prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_PREFIX.into()),
            verbosity: self.verbosity.unwrap_or(DEFAULT_VERBOSITY),
            format,
            file: self.file.clone(),
        })
    }
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Transport kind for the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Stream transport over TCP.
    Tcp,
}

/// Resolved logger configuration.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Filter target prefix.
    pub prefix: String,
    /// Verbosity level.
    pub verbosity: u8,
    /// Output format.
    pub format: LogFormat,
    /// Optional log file path.
    pub file: Option<PathBuf>,
}

/// Resolved server configuration. Immutable after [`ServerOptions::resolve`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host.
    pub address: String,
    /// Bind port.
    pub port: u16,
    /// Worker pool capacity.
    pub workers: usize,
    /// Connection timeout.
    pub timeout: Duration,
    /// Transport kind.
    pub transport: TransportKind,
    /// Logger configuration.
    pub logger: LoggerConfig,
}

impl ServerConfig {
    /// Keep-alive period derived from the timeout: 90% of its value.
    /// Bounds each accept poll in the serve loop.
    pub fn keep_alive(&self) -> Duration {
        self.timeout - self.timeout / 10
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string of the form `<integer><unit>` where unit is one
/// of `ms`, `s`, `m`, `h`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| malformed_duration(raw))?;
    let (digits, unit) = raw.split_at(split);

    let value: u64 = digits.parse().map_err(|_| malformed_duration(raw))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(malformed_duration(raw)),
    }
}

fn malformed_duration(raw: &str) -> Error {
    Error::Config {
        message: format!("could not parse duration: {:?}", raw),
    }
}
