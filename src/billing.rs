//! Billing collaborator invoked by the Stripe webhook job.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// A verified Stripe event, reduced to what the handlers need.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    /// Stripe event id, `evt_...`.
    pub event_id: String,
    /// `data.object` of the event: a checkout session, subscription or invoice.
    pub object: Value,
}

impl BillingEvent {
    /// The `id` of the event's object, if it has one.
    pub fn object_id(&self) -> Option<&str> {
        self.object.get("id").and_then(Value::as_str)
    }

    /// The `customer` of the event's object, if it has one.
    pub fn customer_id(&self) -> Option<&str> {
        self.object.get("customer").and_then(Value::as_str)
    }
}

/// Applies Stripe events to local billing state.
///
/// Errors are retried by the queue up to the webhook job's max attempts.
#[async_trait]
pub trait BillingHandler: Send + Sync {
    /// `checkout.session.completed`
    async fn checkout_completed(&self, event: &BillingEvent) -> anyhow::Result<()>;
    /// `customer.subscription.created`
    async fn subscription_created(&self, event: &BillingEvent) -> anyhow::Result<()>;
    /// `customer.subscription.updated`
    async fn subscription_updated(&self, event: &BillingEvent) -> anyhow::Result<()>;
    /// `customer.subscription.deleted`
    async fn subscription_deleted(&self, event: &BillingEvent) -> anyhow::Result<()>;
    /// `invoice.payment_succeeded`
    async fn invoice_payment_succeeded(&self, event: &BillingEvent) -> anyhow::Result<()>;
    /// `invoice.payment_failed`
    async fn invoice_payment_failed(&self, event: &BillingEvent) -> anyhow::Result<()>;
}

/// Handler for deployments without billing; acknowledges every event.
#[derive(Debug, Clone, Default)]
pub struct LoggingBillingHandler;

impl LoggingBillingHandler {
    fn log(kind: &str, event: &BillingEvent) {
        info!(
            event.id = %event.event_id,
            object.id = event.object_id().unwrap_or_default(),
            customer.id = event.customer_id().unwrap_or_default(),
            "Acknowledged {kind} without a billing backend"
        );
    }
}

#[async_trait]
impl BillingHandler for LoggingBillingHandler {
    async fn checkout_completed(&self, event: &BillingEvent) -> anyhow::Result<()> {
        Self::log("checkout completion", event);
        Ok(())
    }

    async fn subscription_created(&self, event: &BillingEvent) -> anyhow::Result<()> {
        Self::log("subscription creation", event);
        Ok(())
    }

    async fn subscription_updated(&self, event: &BillingEvent) -> anyhow::Result<()> {
        Self::log("subscription update", event);
        Ok(())
    }

    async fn subscription_deleted(&self, event: &BillingEvent) -> anyhow::Result<()> {
        Self::log("subscription deletion", event);
        Ok(())
    }

    async fn invoice_payment_succeeded(&self, event: &BillingEvent) -> anyhow::Result<()> {
        Self::log("invoice payment", event);
        Ok(())
    }

    async fn invoice_payment_failed(&self, event: &BillingEvent) -> anyhow::Result<()> {
        Self::log("failed invoice payment", event);
        Ok(())
    }
}
