//! The notification port used by email processors and critical alerts.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An email message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Email {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html: html.into(),
            text: None,
            from: None,
        }
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..self
        }
    }

    pub fn with_from(self, from: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            ..self
        }
    }

    pub(crate) fn validate(&self) -> Result<(), MailerError> {
        let valid = self
            .to
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if valid {
            Ok(())
        } else {
            Err(MailerError::InvalidRecipient(self.to.clone()))
        }
    }
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("Invalid recipient address: {0:?}")]
    InvalidRecipient(String),
    #[error("Failed to deliver email: {0}")]
    Delivery(String),
}

/// Something that can send an [`Email`].
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, email: &Email) -> Result<(), MailerError>;
}

/// A [`Mailer`] that only logs the messages it is asked to send.
///
/// Useful in development where no email provider is configured.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_email(&self, email: &Email) -> Result<(), MailerError> {
        email.validate()?;
        tracing::info!(to = %email.to, subject = %email.subject, "Sending email to {}", email.to);
        Ok(())
    }
}
