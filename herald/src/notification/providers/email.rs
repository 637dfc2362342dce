//! Email delivery over SMTP.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{DeliveryOutcome, DeliveryProvider, FailureClass, is_valid_email, truncate_chars};
use crate::domain::{Channel, DeliveryRecord, Notification};

/// SMTP replies that reject the mailbox itself.
const MAILBOX_REJECTION_CODES: &[&str] = &["550", "551", "553"];

/// Email provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from_address: String,
    /// Log instead of sending; always available.
    pub mock_mode: bool,
    /// Body length cap in characters.
    pub max_content_length: usize,
    pub rate_limit_per_minute: u32,
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            from_address: String::new(),
            mock_mode: false,
            max_content_length: 100_000,
            rate_limit_per_minute: 600,
            timeout_secs: 30,
        }
    }
}

/// Email provider.
pub struct EmailProvider {
    config: EmailConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl EmailProvider {
    pub fn new(config: EmailConfig) -> Self {
        let transport = if config.mock_mode || config.smtp_host.is_empty() {
            None
        } else {
            match AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host) {
                Ok(builder) => {
                    let mut builder = builder
                        .port(config.smtp_port)
                        .timeout(Some(Duration::from_secs(config.timeout_secs)));
                    if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password)
                    {
                        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
                    }
                    Some(builder.build())
                }
                Err(e) => {
                    warn!(host = %config.smtp_host, error = %e, "Invalid SMTP relay configuration");
                    None
                }
            }
        };

        Self { config, transport }
    }

    fn build_message(&self, notification: &Notification) -> Result<Message, DeliveryOutcome> {
        let from: Mailbox = self.config.from_address.parse().map_err(|e| {
            DeliveryOutcome::failed_with_code(
                FailureClass::Rejected,
                "FROM_ADDRESS",
                format!("Invalid from address: {}", e),
            )
        })?;
        let to: Mailbox = notification.recipient.parse().map_err(|e| {
            DeliveryOutcome::failed(
                FailureClass::InvalidRecipient,
                format!("Invalid recipient address: {}", e),
            )
        })?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(truncate_chars(
                &notification.body,
                self.config.max_content_length,
            ))
            .map_err(|e| DeliveryOutcome::failed(FailureClass::Rejected, e.to_string()))
    }
}

/// Map an SMTP error to an outcome by reply class.
fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> DeliveryOutcome {
    let code = err.status().map(|c| c.to_string());
    let response_code = code.as_deref().and_then(|c| c.parse::<i32>().ok());

    let outcome = if err.is_permanent() {
        match code.as_deref() {
            Some(c) if MAILBOX_REJECTION_CODES.contains(&c) => {
                DeliveryOutcome::bounced(err.to_string())
            }
            _ => DeliveryOutcome::failed(FailureClass::Rejected, err.to_string()),
        }
    } else if err.is_transient() {
        match code.as_deref() {
            Some("421") | Some("450") => {
                DeliveryOutcome::failed(FailureClass::Throttled, err.to_string())
            }
            _ => DeliveryOutcome::failed(FailureClass::ServerError, err.to_string()),
        }
    } else if err.is_timeout() {
        DeliveryOutcome::failed(FailureClass::Timeout, err.to_string())
    } else {
        DeliveryOutcome::failed(FailureClass::Network, err.to_string())
    };
    outcome.with_response_code(response_code)
}

#[async_trait]
impl DeliveryProvider for EmailProvider {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    fn can_handle(&self, notification: &Notification) -> bool {
        notification.channel == Channel::Email && is_valid_email(&notification.recipient)
    }

    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let started = Instant::now();

        if self.config.mock_mode {
            debug!(
                notification_id = %notification.id,
                to = %notification.recipient,
                subject = %notification.subject,
                "Mock email delivered"
            );
            return DeliveryOutcome::delivered(Some(format!("mock-{}", uuid::Uuid::new_v4())))
                .with_response_code(Some(250))
                .with_latency(started.elapsed());
        }

        let Some(transport) = &self.transport else {
            return DeliveryOutcome::failed_with_code(
                FailureClass::Rejected,
                "NOT_CONFIGURED",
                "SMTP transport not configured",
            );
        };

        let message = match self.build_message(notification) {
            Ok(message) => message,
            Err(outcome) => return outcome.with_latency(started.elapsed()),
        };

        match transport.send(message).await {
            Ok(response) => {
                let reply = response.first_line().map(str::to_string);
                debug!(
                    notification_id = %notification.id,
                    code = %response.code(),
                    "Email accepted by relay"
                );
                DeliveryOutcome::delivered(Some(notification.id.clone()))
                    .with_provider_message_id(reply)
                    .with_response_code(response.code().to_string().parse().ok())
                    .with_latency(started.elapsed())
            }
            Err(e) => classify_smtp_error(&e).with_latency(started.elapsed()),
        }
    }

    async fn check_status(&self, record: &DeliveryRecord) -> DeliveryOutcome {
        // SMTP acceptance is the final confirmation available.
        DeliveryOutcome::pending(record.external_id.clone())
    }

    fn is_available(&self) -> bool {
        self.config.mock_mode || (self.transport.is_some() && !self.config.from_address.is_empty())
    }

    fn rate_limit(&self) -> u32 {
        self.config.rate_limit_per_minute
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}
