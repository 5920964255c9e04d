//! IMAP transport, session operations, and the per-call connection lifecycle
//!
//! Provides timeout-bounded wrappers around `async-imap` operations. All
//! network calls use TLS, and timeouts are derived from process config.
//! Sessions are strictly per-invocation: [`with_session`] acquires a fresh
//! authenticated connection, runs exactly one unit of work, and logs out on
//! every exit path. No pooling, no reuse, no retries.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Fetch;
use async_imap::{Client, Session};
use futures::TryStreamExt;
use futures::future::BoxFuture;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::Config;
use crate::errors::{AppError, AppResult};

/// Type alias for authenticated IMAP session over TLS
///
/// Wraps the TLS stream type to simplify signatures throughout the codebase.
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Get socket timeout duration from process config
///
/// Helper to avoid repeatedly accessing the config field.
fn socket_timeout(config: &Config) -> Duration {
    Duration::from_millis(config.socket_timeout_ms)
}

/// Run one unit of work against a fresh authenticated session
///
/// Acquires a new connection, optionally EXAMINEs `folder`, executes the
/// caller-supplied operation, and releases the session unconditionally:
/// success, business error, and transport error all route through LOGOUT
/// before the result is returned. A logout failure is logged and never masks
/// the operation's own result. Released sessions are never reused.
///
/// # Errors
///
/// Propagates acquisition, folder-open, and operation errors unchanged.
pub async fn with_session<T>(
    config: &Config,
    folder: Option<&str>,
    op: impl for<'s> FnOnce(&'s Config, &'s mut ImapSession) -> BoxFuture<'s, AppResult<T>>,
) -> AppResult<T> {
    let mut session = connect_authenticated(config).await?;

    if let Some(folder) = folder
        && let Err(e) = examine_folder(config, &mut session, folder).await
    {
        release(config, session).await;
        return Err(e);
    }

    let result = op(config, &mut session).await;
    release(config, session).await;
    result
}

/// Close a session, absorbing release failures
async fn release(config: &Config, mut session: ImapSession) {
    match timeout(socket_timeout(config), session.logout()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "IMAP logout failed"),
        Err(_) => tracing::debug!("IMAP logout timed out"),
    }
}

/// Connect to the IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with system root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Timeouts
///
/// - TCP connect: `connect_timeout_ms`
/// - TLS handshake: `greeting_timeout_ms`
/// - Greeting read: `greeting_timeout_ms`
/// - LOGIN: `greeting_timeout_ms`
///
/// # Errors
///
/// - `InvalidInput` if the hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Transport` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(config: &Config) -> AppResult<ImapSession> {
    let connect_duration = Duration::from_millis(config.connect_timeout_ms);
    let greeting_duration = Duration::from_millis(config.greeting_timeout_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((config.imap_host.as_str(), config.imap_port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Transport(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(config.imap_host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Transport(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = config.password.expose_secret();
    let session = timeout(greeting_duration, client.login(config.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::Transport(msg)
                }
            })
        })?;

    Ok(session)
}

/// Open a folder in read-only mode
///
/// Uses `EXAMINE` so listing and searching never mark messages as read.
pub async fn examine_folder(
    config: &Config,
    session: &mut ImapSession,
    folder: &str,
) -> AppResult<()> {
    timeout(socket_timeout(config), session.examine(folder))
        .await
        .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for folder '{folder}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::NotFound(format!("cannot open folder '{folder}': {e}")))
        })?;
    Ok(())
}

/// List all visible mailboxes/folders
pub async fn list_all_mailboxes(
    config: &Config,
    session: &mut ImapSession,
) -> AppResult<Vec<async_imap::types::Name>> {
    let stream = timeout(socket_timeout(config), session.list(None, Some("*")))
        .await
        .map_err(|_| AppError::Timeout("LIST timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("LIST failed: {e}"))))?;

    timeout(socket_timeout(config), stream.try_collect::<Vec<_>>())
        .await
        .map_err(|_| AppError::Timeout("LIST stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("LIST stream failed: {e}"))))
}

/// Search the open folder for matching UIDs
///
/// Runs `UID SEARCH` with a compiled search program. The collaborator
/// returns an unordered set; UIDs are reported ascending, which is the
/// mailbox order an IMAP server lists them in.
pub async fn uid_search(
    config: &Config,
    session: &mut ImapSession,
    program: &str,
) -> AppResult<Vec<u32>> {
    let set = timeout(socket_timeout(config), session.uid_search(program))
        .await
        .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("uid search failed: {e}"))))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

/// Fetch a set of messages with the given item list
///
/// `set` is an IMAP UID set (`"42"`, `"1,5,9"`, or `"1:*"` for the full
/// folder range).
pub async fn uid_fetch(
    config: &Config,
    session: &mut ImapSession,
    set: &str,
    items: &str,
) -> AppResult<Vec<Fetch>> {
    let stream = timeout(socket_timeout(config), session.uid_fetch(set, items))
        .await
        .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("uid fetch failed: {e}"))))?;
    timeout(socket_timeout(config), stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("uid fetch stream failed: {e}"))))
}
