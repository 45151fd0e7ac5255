//! Outbound mail.
//!
//! One connection per send, no pooling. With TLS enabled the transport
//! dials implicit TLS on 465 first and falls back to STARTTLS on 587
//! when that dial fails.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::SmtpOptions;
use crate::error::{BaliseError, Result};

/// Mail sink used by the notification workers.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// SMTP-backed mailer.
pub struct SmtpMailer {
    options: SmtpOptions,
}

impl SmtpMailer {
    #[must_use]
    pub fn new(options: SmtpOptions) -> Self {
        Self { options }
    }

    fn message(&self, to: &str, subject: &str, body: &str) -> Result<Message> {
        Message::builder()
            .from(self.options.from.parse().map_err(|e| {
                BaliseError::internal(format!("invalid from address '{}': {e}", self.options.from))
            })?)
            .to(to
                .parse()
                .map_err(|e| BaliseError::internal(format!("invalid recipient '{to}': {e}")))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| BaliseError::internal(format!("message build failed: {e}")))
    }

    fn transport(&self, starttls_fallback: bool) -> Result<SmtpTransport> {
        let host = self.options.host.as_str();
        let builder = if !self.options.use_tls {
            SmtpTransport::builder_dangerous(host).port(self.options.port)
        } else if starttls_fallback {
            SmtpTransport::starttls_relay(host)
                .map_err(|e| BaliseError::internal(format!("starttls transport: {e}")))?
        } else {
            SmtpTransport::relay(host)
                .map_err(|e| BaliseError::internal(format!("smtps transport: {e}")))?
        };
        let builder = if self.options.username.is_empty() {
            builder
        } else {
            builder.credentials(Credentials::new(
                self.options.username.clone(),
                self.options.password.clone(),
            ))
        };
        Ok(builder.build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let message = self.message(to, subject, body)?;
        let primary = self.transport(false)?;
        let use_tls = self.options.use_tls;
        let fallback = if use_tls { Some(self.transport(true)?) } else { None };

        let to_owned = to.to_string();
        tokio::task::spawn_blocking(move || {
            match primary.send(&message) {
                Ok(_) => Ok(()),
                Err(first) => {
                    // Implicit TLS on 465 did not work; try STARTTLS on 587.
                    if let Some(fallback) = fallback {
                        tracing::warn!(error = %first, "SMTPS dial failed, retrying via STARTTLS");
                        fallback.send(&message).map(|_| ()).map_err(|second| {
                            BaliseError::internal(format!(
                                "mail to {to_owned} failed over both transports: {second}"
                            ))
                        })
                    } else {
                        Err(BaliseError::internal(format!("mail to {to_owned} failed: {first}")))
                    }
                }
            }
        })
        .await
        .map_err(|e| BaliseError::internal(format!("mail task failed: {e}")))?
    }
}
