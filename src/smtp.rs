//! SMTP delivery via a process-scoped `lettre` transport
//!
//! One [`Mailer`] is built at startup from config and shared across every
//! `send_email` call; its internal connection handling is opaque to this
//! layer. Port 465 uses implicit TLS, every other port uses STARTTLS.

use lettre::message::MultiPart;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{AppError, AppResult};

/// Delivery confirmation returned by a successful submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Message-ID header assigned to the outbound message
    pub message_id: String,
    /// SMTP reply (code and text) from the submission
    pub status: String,
}

/// Process-scoped delivery handle
///
/// Wraps the long-lived SMTP transport and the configured sender address.
#[derive(Clone)]
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: lettre::message::Mailbox,
    host: String,
}

impl Mailer {
    /// Build the shared transport from process config
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the relay host is unusable or the
    /// configured account address does not parse as a mailbox.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let builder = if config.smtp_secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| AppError::Config(format!("invalid SMTP host '{}': {e}", config.smtp_host)))?;

        let sender = config
            .user
            .parse::<lettre::message::Mailbox>()
            .map_err(|e| AppError::Config(format!("EMAIL_USER is not a valid mailbox: {e}")))?;

        Ok(Self {
            transport: builder
                .port(config.smtp_port)
                .credentials(Credentials::new(
                    config.user.clone(),
                    config.password.expose_secret().to_owned(),
                ))
                .build(),
            sender,
            host: config.smtp_host.clone(),
        })
    }

    /// Submit one message using the configured account as sender
    ///
    /// Builds `multipart/alternative` when an HTML body is supplied, plain
    /// text otherwise, with a generated Message-ID.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] carrying the underlying delivery
    /// failure text.
    pub async fn send(
        &self,
        to: lettre::message::Mailbox,
        subject: &str,
        text: &str,
        html: Option<&str>,
    ) -> AppResult<DeliveryReceipt> {
        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.host);
        let builder = Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(subject)
            .message_id(Some(message_id.clone()));

        let message = match html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                text.to_owned(),
                html.to_owned(),
            )),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.to_owned()),
        }
        .map_err(|e| AppError::Internal(format!("failed to build message: {e}")))?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| AppError::Transport(format!("smtp delivery failed: {e}")))?;

        Ok(DeliveryReceipt {
            message_id,
            status: format_reply(&response),
        })
    }
}

/// Render an SMTP reply as "code text..."
fn format_reply(response: &lettre::transport::smtp::response::Response) -> String {
    let mut parts = vec![response.code().to_string()];
    parts.extend(response.message().map(str::to_owned));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use lettre::message::Mailbox;

    #[test]
    fn recipient_mailbox_parses_plain_and_named_forms() {
        assert!("alice@example.com".parse::<Mailbox>().is_ok());
        assert!("Alice <alice@example.com>".parse::<Mailbox>().is_ok());
        assert!("not-an-address".parse::<Mailbox>().is_err());
    }

    #[test]
    fn generated_message_ids_are_angle_bracketed_and_unique() {
        let host = "smtp.example.com";
        let a = format!("<{}@{}>", uuid::Uuid::new_v4(), host);
        let b = format!("<{}@{}>", uuid::Uuid::new_v4(), host);
        assert!(a.starts_with('<') && a.ends_with('>'));
        assert!(a.contains("@smtp.example.com"));
        assert_ne!(a, b);
    }
}
