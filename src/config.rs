//! Configuration module for the mail account and transport endpoints
//!
//! All configuration is loaded from environment variables at process start and
//! validated before the server accepts any operation. A violation of any rule
//! below is a fatal [`AppError::Config`]; the process must not begin serving
//! with invalid configuration.
//!
//! Required variables: `EMAIL_USER`, `EMAIL_PASSWORD`, `IMAP_HOST`,
//! `IMAP_PORT`, `SMTP_HOST`, `SMTP_PORT`.

use std::env;
use std::env::VarError;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Port on which SMTP submission uses implicit TLS rather than STARTTLS
const SMTPS_PORT: u16 = 465;

/// Process configuration
///
/// Holds the single configured account plus IMAP and SMTP endpoints. The
/// password is stored using `SecretString` to prevent accidental logging.
/// Cloned into the MCP handler via `Arc` for thread-safe shared access.
#[derive(Debug, Clone)]
pub struct Config {
    /// Account address; used for IMAP LOGIN, SMTP AUTH, and the From header
    pub user: String,
    /// Account secret stored in a type that prevents accidental logging
    pub password: SecretString,
    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port (typically 993)
    pub imap_port: u16,
    /// SMTP server hostname
    pub smtp_host: String,
    /// SMTP server port (465 for implicit TLS, otherwise STARTTLS)
    pub smtp_port: u16,
    /// Whether SMTP submission uses implicit TLS (derived from the port)
    pub smtp_secure: bool,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
}

impl Config {
    /// Load and validate all configuration from environment variables
    ///
    /// This is a one-shot operation run once at process start; there are no
    /// retries. Ports must be digits-only strings coercible to `u16`, and
    /// `EMAIL_USER` must be a syntactically valid email address.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] naming the offending variable if any
    /// required value is absent or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// EMAIL_USER=user@example.com
    /// EMAIL_PASSWORD=app-password
    /// IMAP_HOST=imap.example.com
    /// IMAP_PORT=993
    /// SMTP_HOST=smtp.example.com
    /// SMTP_PORT=465
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let user = required_env("EMAIL_USER")?;
        if !is_valid_email(&user) {
            return Err(AppError::Config(format!(
                "EMAIL_USER '{user}' is not a valid email address"
            )));
        }
        let password = required_env("EMAIL_PASSWORD")?;
        let smtp_port = parse_port_env("SMTP_PORT")?;

        Ok(Self {
            user,
            password: SecretString::new(password.into()),
            imap_host: required_env("IMAP_HOST")?,
            imap_port: parse_port_env("IMAP_PORT")?,
            smtp_host: required_env("SMTP_HOST")?,
            smtp_port,
            smtp_secure: smtp_port == SMTPS_PORT,
            connect_timeout_ms: parse_u64_env("EMAIL_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_u64_env("EMAIL_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: parse_u64_env("EMAIL_SOCKET_TIMEOUT_MS", 300_000)?,
        })
    }
}

/// Check a string against basic email address syntax
///
/// Local part, `@`, domain with at least one dot, no whitespace. This gates
/// configuration only; recipient addresses are validated by the delivery
/// library's mailbox parser.
pub fn is_valid_email(value: &str) -> bool {
    // The pattern is a literal, so compilation cannot fail at runtime.
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Config(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Parse a required port variable as a digits-only string coerced to `u16`
///
/// # Errors
///
/// Returns [`AppError::Config`] if the variable is missing, contains
/// non-digit characters, or does not fit in a `u16`.
fn parse_port_env(key: &str) -> AppResult<u16> {
    let raw = required_env(key)?;
    parse_port_value(&raw)
        .ok_or_else(|| AppError::Config(format!("invalid port in {key}: '{raw}'")))
}

/// Coerce a digits-only string into a port number
fn parse_port_value(value: &str) -> Option<u16> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<u16>().ok()
}

/// Parse a `u64` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns [`AppError::Config`] if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|_| {
            AppError::Config(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::Config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}
