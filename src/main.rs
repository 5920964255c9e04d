//! mail-bridge-mcp-rs: IMAP/SMTP email MCP server over stdio
//!
//! This server exposes a small set of email operations (send, search, list
//! folders, read inbox) to an MCP host over stdio. Mailbox reads open a
//! fresh TLS IMAP connection per invocation; delivery reuses one SMTP
//! transport built at startup.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and stdio serving
//! - [`config`]: Environment-driven configuration, validated at startup
//! - [`errors`]: Application error model with MCP error mapping
//! - [`imap`]: IMAP transport, per-call session lifecycle, timeout wrappers
//! - [`smtp`]: Process-scoped delivery transport and message submission
//! - [`query`]: Search criteria / fetch projection schemas and compilation
//! - [`models`]: Entity shapes, transport-record mapping, tool input DTOs
//! - [`server`]: MCP tool and resource handlers

mod config;
mod errors;
mod imap;
mod models;
mod query;
mod server;
mod smtp;

use config::Config;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use smtp::Mailer;
use tracing_subscriber::EnvFilter;

/// Application entry point
///
/// Initializes tracing from environment, loads and validates config, builds
/// the shared SMTP transport, and serves the MCP server over stdio. Any
/// configuration violation terminates the process before it accepts
/// operations. This process expects to be spawned by an MCP client via
/// `stdio` transport.
///
/// # Environment Variables
///
/// See [`Config::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// EMAIL_USER=user@example.com \
/// EMAIL_PASSWORD=secret \
/// IMAP_HOST=imap.example.com IMAP_PORT=993 \
/// SMTP_HOST=smtp.example.com SMTP_PORT=465 \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_from_env()?;
    let mailer = Mailer::from_config(&config)?;
    let service = server::MailBridgeServer::new(config, mailer)
        .serve(stdio())
        .await?;
    service.waiting().await?;
    Ok(())
}
