use super::{JobContext, QUEUE_WEBHOOKS, WEBHOOK_MAX_ATTEMPTS};
use crate::BackgroundJob;
use crate::billing::{BillingEvent, BillingHandler};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// A Stripe webhook that passed signature verification in the API.
///
/// Deduplicated on all fields, so Stripe redelivering an event while the
/// first copy is queued, or within a day after it was applied, does not apply
/// it twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeWebhookArgs {
    /// `evt_...`
    pub event_id: String,
    /// e.g. `invoice.payment_failed`
    pub event_type: String,
    /// Raw event body.
    pub payload: String,
}

/// Event types with a billing side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeEventKind {
    /// `checkout.session.completed`
    CheckoutCompleted,
    /// `customer.subscription.created`
    SubscriptionCreated,
    /// `customer.subscription.updated`
    SubscriptionUpdated,
    /// `customer.subscription.deleted`
    SubscriptionDeleted,
    /// `invoice.payment_succeeded`
    InvoicePaymentSucceeded,
    /// `invoice.payment_failed`
    InvoicePaymentFailed,
}

impl StripeEventKind {
    /// Maps a Stripe event type; `None` for types we don't act on.
    pub fn parse(event_type: &str) -> Option<Self> {
        Some(match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            _ => return None,
        })
    }
}

#[derive(Deserialize)]
struct EventEnvelope {
    data: EventData,
}

#[derive(Deserialize)]
struct EventData {
    object: Value,
}

/// Routes one webhook to the matching billing handler method.
///
/// Unknown event types succeed without touching the payload.
pub async fn dispatch_stripe_event(
    handler: &dyn BillingHandler,
    args: &StripeWebhookArgs,
) -> anyhow::Result<()> {
    let Some(kind) = StripeEventKind::parse(&args.event_type) else {
        info!(
            event.id = %args.event_id,
            event.type = %args.event_type,
            "Ignoring unhandled Stripe event type"
        );
        return Ok(());
    };

    let envelope: EventEnvelope = serde_json::from_str(&args.payload)
        .with_context(|| format!("invalid payload for Stripe event {}", args.event_id))?;
    let event = BillingEvent {
        event_id: args.event_id.clone(),
        object: envelope.data.object,
    };

    debug!(event.id = %args.event_id, ?kind, "Dispatching Stripe event");
    match kind {
        StripeEventKind::CheckoutCompleted => handler.checkout_completed(&event).await,
        StripeEventKind::SubscriptionCreated => handler.subscription_created(&event).await,
        StripeEventKind::SubscriptionUpdated => handler.subscription_updated(&event).await,
        StripeEventKind::SubscriptionDeleted => handler.subscription_deleted(&event).await,
        StripeEventKind::InvoicePaymentSucceeded => handler.invoice_payment_succeeded(&event).await,
        StripeEventKind::InvoicePaymentFailed => handler.invoice_payment_failed(&event).await,
    }
}

impl BackgroundJob for StripeWebhookArgs {
    const JOB_NAME: &'static str = "stripe_webhook";
    const QUEUE: &'static str = QUEUE_WEBHOOKS;
    const MAX_ATTEMPTS: Option<i32> = Some(WEBHOOK_MAX_ATTEMPTS);
    const DEDUPLICATED: bool = true;

    type Context = JobContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        dispatch_stripe_event(ctx.billing.as_ref(), self).await
    }
}
