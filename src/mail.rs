//! Email collaborator used by the email jobs and the data-export worker.
//!
//! Delivery itself (SMTP, SES, ...) lives in the API service; jobs only see
//! the [`Mailer`] trait.

use crate::errors::MailError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

/// A templated message: the transport renders `template_name` with `data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    /// Recipient address.
    pub to: String,
    /// Name of the template, e.g. `verify_email`.
    pub template_name: String,
    /// Template variables.
    pub data: Value,
}

impl EmailMessage {
    /// Build a message for `to` using `template_name`.
    pub fn new(to: impl Into<String>, template_name: impl Into<String>, data: Value) -> Self {
        Self {
            to: to.into(),
            template_name: template_name.into(),
            data,
        }
    }

    fn validate(&self) -> Result<(), MailError> {
        if !self.to.contains('@') {
            return Err(MailError::Invalid(format!(
                "recipient `{}` is not an email address",
                self.to
            )));
        }
        if self.template_name.is_empty() {
            return Err(MailError::Invalid("template name is empty".into()));
        }
        Ok(())
    }
}

/// Sends templated email.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one message.
    ///
    /// # Errors
    ///
    /// Returns `MailError` if the message is invalid or the transport fails.
    async fn send(&self, message: EmailMessage) -> Result<(), MailError>;

    /// Whether a transport is configured. Callers skip optional mail when it isn't.
    fn is_available(&self) -> bool {
        true
    }
}

/// Development mailer that logs messages instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), MailError> {
        message.validate()?;
        info!(
            to = %message.to,
            template = %message.template_name,
            data = %message.data,
            "Email logged instead of sent"
        );
        Ok(())
    }
}

/// Mailer for deployments without an email transport.
#[derive(Debug, Clone, Default)]
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), MailError> {
        Err(MailError::Transport(format!(
            "no email transport configured, dropping `{}` to {}",
            message.template_name, message.to
        )))
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records sent messages; optionally fails every send.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingMailer {
        pub(crate) sent: Mutex<Vec<EmailMessage>>,
        pub(crate) fail: bool,
    }

    impl RecordingMailer {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: EmailMessage) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Transport("smtp connection refused".into()));
            }
            message.validate()?;
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(message);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use serde_json::json;

    #[tokio::test]
    async fn log_mailer_validates_recipient() {
        let mailer = LogMailer;
        assert_ok!(
            mailer
                .send(EmailMessage::new("a@b.com", "verify_email", json!({})))
                .await
        );
        assert_err!(
            mailer
                .send(EmailMessage::new("nobody", "verify_email", json!({})))
                .await
        );
    }

    #[tokio::test]
    async fn disabled_mailer_reports_unavailable() {
        let mailer = DisabledMailer;
        assert!(!mailer.is_available());
        assert_err!(
            mailer
                .send(EmailMessage::new("a@b.com", "verify_email", json!({})))
                .await
        );
    }
}
