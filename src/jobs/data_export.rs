use super::{DATA_EXPORT_MAX_ATTEMPTS, JobContext, QUEUE_DEFAULT};
use crate::BackgroundJob;
use crate::export::{self, DataExport, format_bytes};
use crate::mail::EmailMessage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Builds the archive for a requested data export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataExportArgs {
    /// Owner of the data.
    pub user_id: i64,
    /// Where the "export ready" notice goes.
    pub email: String,
    /// Row in `data_exports` created when the user asked for the export.
    pub export_id: i64,
}

impl BackgroundJob for DataExportArgs {
    const JOB_NAME: &'static str = "data_export";
    const QUEUE: &'static str = QUEUE_DEFAULT;
    const MAX_ATTEMPTS: Option<i32> = Some(DATA_EXPORT_MAX_ATTEMPTS);
    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5 * 60));

    type Context = JobContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let export =
            export::generate(&ctx.pool, ctx.storage.as_ref(), self.user_id, self.export_id).await?;
        notify_ready(&ctx, &self.email, &export).await;
        Ok(())
    }

    async fn on_interrupted(&self, ctx: Self::Context, error: &str) -> anyhow::Result<()> {
        let pool = &ctx.pool;
        if export::repository::mark_interrupted(pool, self.export_id, self.user_id, error).await? {
            warn!(export.id = self.export_id, "Data export interrupted: {error}");
        }
        Ok(())
    }
}

/// Tells the user their export is ready. Failures are only logged.
async fn notify_ready(ctx: &JobContext, email: &str, export: &DataExport) {
    if !ctx.mailer.is_available() {
        debug!(export.id = export.id, "Email service not available, skipping export notice");
        return;
    }

    let message = EmailMessage::new(
        email,
        "data_export_ready",
        json!({
            "export_id": export.id,
            "file_size": format_bytes(u64::try_from(export.file_size).unwrap_or(0)),
            "expires_at": export.expires_at.map(|at| at.to_rfc3339()),
            "download_url": ctx.link("/settings/privacy"),
        }),
    );
    if let Err(error) = ctx.mailer.send(message).await {
        warn!(export.id = export.id, %error, "Failed to send data export ready email");
    }
}
