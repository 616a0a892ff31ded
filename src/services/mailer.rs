//! SMTP mailer: renders into one multipart (text + HTML) message and sends it.

use lettre::message::{header, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::config::EmailSettings;
use crate::error::{AppError, AppResult};

/// SMTP delivery service.
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
    to_address: Vec<String>,
}

impl EmailService {
    /// Build from validated email settings (`enable_email` implies all
    /// fields are present; enforced by the config loader).
    pub fn new(settings: &EmailSettings) -> AppResult<Self> {
        let host = settings
            .host
            .as_deref()
            .ok_or_else(|| AppError::Report("SMTP host not configured".to_string()))?;
        let port = settings
            .port
            .ok_or_else(|| AppError::Report("SMTP port not configured".to_string()))?;
        let user = settings
            .user
            .clone()
            .ok_or_else(|| AppError::Report("SMTP user not configured".to_string()))?;
        let password: &SecretString = settings
            .password
            .as_ref()
            .ok_or_else(|| AppError::Report("SMTP password not configured".to_string()))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| AppError::Report(format!("Invalid SMTP relay '{}': {}", host, e)))?
            .port(port)
            .credentials(Credentials::new(user, password.expose_secret().to_string()))
            .build();

        Ok(Self {
            transport,
            from_address: settings
                .from_address
                .clone()
                .ok_or_else(|| AppError::Report("SMTP from_address not configured".to_string()))?,
            to_address: settings.to_address.clone(),
        })
    }

    /// Send one multipart message to every configured recipient.
    pub async fn send_report(&self, subject: &str, text: &str, html: &str) -> AppResult<()> {
        let mut builder = Message::builder().from(
            self.from_address
                .parse()
                .map_err(|e| AppError::Report(format!("Invalid from address: {}", e)))?,
        );
        for recipient in &self.to_address {
            builder = builder.to(recipient
                .parse()
                .map_err(|e| AppError::Report(format!("Invalid recipient '{}': {}", recipient, e)))?);
        }

        let message = builder
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_PLAIN)
                            .body(text.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_HTML)
                            .body(html.to_string()),
                    ),
            )
            .map_err(|e| AppError::Report(format!("Failed to build message: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::Report(format!("SMTP delivery failed: {}", e)))?;

        info!("Report message sent to {} recipient(s)", self.to_address.len());
        Ok(())
    }
}
