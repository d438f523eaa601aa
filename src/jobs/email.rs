use super::{EMAIL_MAX_ATTEMPTS, JobContext, QUEUE_EMAIL};
use crate::BackgroundJob;
use crate::mail::EmailMessage;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Sends `message`, or skips it when no transport is configured.
///
/// A missing transport is not an error.
async fn deliver(ctx: &JobContext, message: EmailMessage) -> anyhow::Result<()> {
    if !ctx.mailer.is_available() {
        warn!(
            to = %message.to,
            template = %message.template_name,
            "Email service not available, skipping email"
        );
        return Ok(());
    }

    let template = message.template_name.clone();
    ctx.mailer
        .send(message)
        .await
        .with_context(|| format!("failed to send {template} email"))
}

/// Frontend link carrying `token` as its query string, percent-encoded.
fn token_link(ctx: &JobContext, path: &str, token: &str) -> String {
    ctx.link(&format!("{path}?token={}", urlencoding::encode(token)))
}

/// Asks a new user to confirm their email address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationEmailArgs {
    /// Recipient's user id.
    pub user_id: i64,
    /// Recipient address.
    pub email: String,
    /// Display name used in the greeting.
    pub name: String,
    /// Verification token embedded in the link.
    pub token: String,
}

impl BackgroundJob for VerificationEmailArgs {
    const JOB_NAME: &'static str = "verification_email";
    const QUEUE: &'static str = QUEUE_EMAIL;
    const MAX_ATTEMPTS: Option<i32> = Some(EMAIL_MAX_ATTEMPTS);

    type Context = JobContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let link = token_link(&ctx, "/verify-email", &self.token);
        let message = EmailMessage::new(
            &self.email,
            "verify_email",
            json!({
                "user_id": self.user_id,
                "name": self.name,
                "verification_url": link,
            }),
        );
        deliver(&ctx, message).await
    }
}

/// Sends a password reset link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordResetEmailArgs {
    /// Recipient's user id.
    pub user_id: i64,
    /// Recipient address.
    pub email: String,
    /// Display name used in the greeting.
    pub name: String,
    /// Reset token embedded in the link.
    pub token: String,
}

impl BackgroundJob for PasswordResetEmailArgs {
    const JOB_NAME: &'static str = "password_reset_email";
    const QUEUE: &'static str = QUEUE_EMAIL;
    const MAX_ATTEMPTS: Option<i32> = Some(EMAIL_MAX_ATTEMPTS);

    type Context = JobContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let link = token_link(&ctx, "/reset-password", &self.token);
        let message = EmailMessage::new(
            &self.email,
            "reset_password",
            json!({
                "user_id": self.user_id,
                "name": self.name,
                "reset_url": link,
            }),
        );
        deliver(&ctx, message).await
    }
}

/// Delivers one admin announcement to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementEmailArgs {
    /// Announcement being delivered.
    pub announcement_id: i64,
    /// Recipient's user id.
    pub user_id: i64,
    /// Recipient address.
    pub email: String,
    /// Display name used in the greeting.
    pub name: String,
    /// Announcement title, used as subject.
    pub title: String,
    /// Announcement body.
    pub message: String,
}

impl BackgroundJob for AnnouncementEmailArgs {
    const JOB_NAME: &'static str = "announcement_email";
    const QUEUE: &'static str = QUEUE_EMAIL;
    const MAX_ATTEMPTS: Option<i32> = Some(EMAIL_MAX_ATTEMPTS);

    type Context = JobContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let message = EmailMessage::new(
            &self.email,
            "announcement",
            json!({
                "announcement_id": self.announcement_id,
                "name": self.name,
                "title": self.title,
                "message": self.message,
                "dashboard_url": ctx.link("/dashboard"),
            }),
        );
        deliver(&ctx, message).await
    }
}

/// Tells a user their account was locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLockedEmailArgs {
    /// Recipient's user id.
    pub user_id: i64,
    /// Recipient address.
    pub email: String,
    /// Display name used in the greeting.
    pub name: String,
    /// Human readable lock reason.
    pub reason: String,
    /// When the lock lifts; `None` until an admin unlocks the account.
    pub locked_until: Option<DateTime<Utc>>,
}

impl BackgroundJob for AccountLockedEmailArgs {
    const JOB_NAME: &'static str = "account_locked_email";
    const QUEUE: &'static str = QUEUE_EMAIL;
    const MAX_ATTEMPTS: Option<i32> = Some(EMAIL_MAX_ATTEMPTS);

    type Context = JobContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let message = EmailMessage::new(
            &self.email,
            "account_locked",
            json!({
                "user_id": self.user_id,
                "name": self.name,
                "reason": self.reason,
                "locked_until": self.locked_until.map(|at| at.to_rfc3339()),
                "reset_url": ctx.link("/forgot-password"),
            }),
        );
        deliver(&ctx, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::context;
    use crate::mail::DisabledMailer;
    use crate::mail::testing::RecordingMailer;
    use claims::{assert_err, assert_ok};
    use std::sync::Arc;

    fn verification() -> VerificationEmailArgs {
        VerificationEmailArgs {
            user_id: 42,
            email: "ada@example.com".into(),
            name: "Ada".into(),
            token: "abc123".into(),
        }
    }

    #[tokio::test]
    async fn verification_email_links_to_frontend() {
        let mailer = Arc::new(RecordingMailer::default());
        assert_ok!(verification().run(context(mailer.clone())).await);

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert_eq!(sent[0].template_name, "verify_email");
        insta::assert_compact_json_snapshot!(sent[0].data, @r#"{"name": "Ada", "user_id": 42, "verification_url": "https://app.example.com/verify-email?token=abc123"}"#);
    }

    #[tokio::test]
    async fn password_reset_uses_reset_template() {
        let mailer = Arc::new(RecordingMailer::default());
        let args = PasswordResetEmailArgs {
            user_id: 7,
            email: "bob@example.com".into(),
            name: "Bob".into(),
            token: "t0k".into(),
        };
        assert_ok!(args.run(context(mailer.clone())).await);

        let sent = mailer.sent();
        assert_eq!(sent[0].template_name, "reset_password");
        assert_eq!(
            sent[0].data["reset_url"],
            "https://app.example.com/reset-password?token=t0k"
        );
    }

    #[tokio::test]
    async fn tokens_are_percent_encoded_in_links() {
        let mailer = Arc::new(RecordingMailer::default());
        let args = PasswordResetEmailArgs {
            user_id: 7,
            email: "bob@example.com".into(),
            name: "Bob".into(),
            token: "a+b/c=&next=/admin".into(),
        };
        assert_ok!(args.run(context(mailer.clone())).await);

        assert_eq!(
            mailer.sent()[0].data["reset_url"],
            "https://app.example.com/reset-password?token=a%2Bb%2Fc%3D%26next%3D%2Fadmin"
        );
    }

    #[tokio::test]
    async fn account_locked_without_expiry() {
        let mailer = Arc::new(RecordingMailer::default());
        let args = AccountLockedEmailArgs {
            user_id: 7,
            email: "bob@example.com".into(),
            name: "Bob".into(),
            reason: "too many failed logins".into(),
            locked_until: None,
        };
        assert_ok!(args.run(context(mailer.clone())).await);
        assert!(mailer.sent()[0].data["locked_until"].is_null());
    }

    #[tokio::test]
    async fn transport_errors_are_returned_for_retry() {
        let mailer = Arc::new(RecordingMailer::failing());
        let error = assert_err!(verification().run(context(mailer)).await);
        assert!(error.to_string().contains("verify_email"));
    }

    #[tokio::test]
    async fn unavailable_mailer_skips_without_error() {
        assert_ok!(verification().run(context(Arc::new(DisabledMailer))).await);
    }
}
