//! Delivery of login tokens.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use openheart_core::{AppError, AppResult, SmtpConfig};
use std::sync::Arc;

const TOKEN_SUBJECT: &str = "Your OpenHeart login token";

#[async_trait]
pub trait TokenSender: Send + Sync {
    async fn send_token(&self, email: &str, token: &str) -> AppResult<()>;
}

/// SMTP sender when `SMTP_HOST` is set, otherwise [`LogTokenSender`].
pub fn sender_from_config(config: &SmtpConfig) -> anyhow::Result<Arc<dyn TokenSender>> {
    match SmtpTokenSender::from_config(config)? {
        Some(sender) => Ok(Arc::new(sender)),
        None => {
            tracing::warn!("SMTP_HOST not set; login tokens will not be mailed");
            Ok(Arc::new(LogTokenSender))
        }
    }
}

/// Records that a token was issued without revealing it.
#[derive(Debug, Clone, Default)]
pub struct LogTokenSender;

#[async_trait]
impl TokenSender for LogTokenSender {
    async fn send_token(&self, email: &str, _token: &str) -> AppResult<()> {
        tracing::info!(email = %email, "Login token issued (mail delivery disabled)");
        Ok(())
    }
}

#[derive(Clone)]
pub struct SmtpTokenSender {
    mailer: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpTokenSender {
    /// `None` when no SMTP host is configured.
    pub fn from_config(config: &SmtpConfig) -> anyhow::Result<Option<Self>> {
        let Some(host) = config.host.as_deref() else {
            return Ok(None);
        };
        let from: Mailbox = config
            .from
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("SMTP_HOST requires SMTP_FROM to be set"))?
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid SMTP_FROM: {}", e))?;
        let credentials = match (config.user.as_ref(), config.password.as_ref()) {
            (Some(u), Some(p)) => Some(Credentials::new(u.clone(), p.clone())),
            _ => None,
        };

        let builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(config.port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(config.port)
        };
        let builder = match credentials {
            Some(credentials) => builder.credentials(credentials),
            None => builder,
        };
        tracing::info!(
            host = %host,
            port = config.port,
            tls = config.tls,
            "Token mailer initialized"
        );

        Ok(Some(Self {
            mailer: Arc::new(builder.build()),
            from,
        }))
    }
}

#[async_trait]
impl TokenSender for SmtpTokenSender {
    async fn send_token(&self, email: &str, token: &str) -> AppResult<()> {
        let to: Mailbox = email
            .parse()
            .map_err(|e| AppError::InvalidInput(format!("Invalid email address: {}", e)))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(TOKEN_SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(token_body(token))
            .map_err(|e| AppError::Internal(format!("Failed to build token mail: {}", e)))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to send token mail: {}", e)))?;
        tracing::info!(email = %email, "Login token mailed");
        Ok(())
    }
}

fn token_body(token: &str) -> String {
    format!(
        "Your login token is {}.\n\nIt can be used once. Request a new token to log in again.\n",
        token
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_host_means_no_smtp_sender() {
        let config = SmtpConfig::default();
        assert!(SmtpTokenSender::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_host_without_sender_address_is_rejected() {
        let config = SmtpConfig {
            host: Some("smtp.example.com".to_string()),
            port: 587,
            tls: true,
            ..SmtpConfig::default()
        };
        assert!(SmtpTokenSender::from_config(&config).is_err());
    }

    #[test]
    fn test_token_body_contains_token() {
        assert!(token_body("04217").contains("04217"));
    }

    #[tokio::test]
    async fn test_log_sender_accepts_token() {
        LogTokenSender.send_token("a@example.com", "12345").await.unwrap();
    }
}
