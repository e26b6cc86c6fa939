//! Server settings module.
//!
//! Parses listener and config-file settings from environment variables.
//! Command-line flags in the binary override these values.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PGCH_PORT` | No | 3000 | HTTP server port |
//! | `PGCH_HOST` | No | 127.0.0.1 | Listen address |
//! | `PGCH_CONFIG` | No | `~/.config/piggychick/config.jsonc` | Roots config file |

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::roots::default_config_path;

/// Default HTTP server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default listen address.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Errors that can occur when parsing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// No config path was given and the home directory is unknown.
    #[error("cannot determine home directory for the default config path")]
    NoHomeDir,
}

/// Listener and config-file settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// HTTP server port.
    pub port: u16,

    /// Listen address.
    pub host: IpAddr,

    /// Location of the roots config file.
    pub config_path: PathBuf,
}

impl Settings {
    /// Parse settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if a variable is malformed or if no config
    /// path is set and the home directory cannot be determined.
    pub fn from_env() -> Result<Self, SettingsError> {
        let port = parse_port()?;
        let host = parse_host()?;
        let config_path = match non_empty_var("PGCH_CONFIG")? {
            Some(path) => PathBuf::from(path),
            None => default_config_path().ok_or(SettingsError::NoHomeDir)?,
        };

        Ok(Self {
            port,
            host,
            config_path,
        })
    }
}

/// Reads a variable, treating unset and blank the same.
fn non_empty_var(name: &str) -> Result<Option<String>, SettingsError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(SettingsError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

fn parse_port() -> Result<u16, SettingsError> {
    match non_empty_var("PGCH_PORT")? {
        Some(port) => Ok(port.parse()?),
        None => Ok(DEFAULT_PORT),
    }
}

fn parse_host() -> Result<IpAddr, SettingsError> {
    let raw = non_empty_var("PGCH_HOST")?.unwrap_or_else(|| DEFAULT_HOST.to_string());
    raw.parse().map_err(|_| SettingsError::InvalidFormat {
        var: "PGCH_HOST".to_string(),
        message: format!("expected an IP address, got '{raw}'"),
    })
}
