use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Turns a caught panic payload into an error describing it.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

/// Runs `callback` inside a Sentry performance transaction named after the job.
///
/// Without an installed Sentry client this only costs a few allocations.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "jobs.perform");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    tx.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    result
}
