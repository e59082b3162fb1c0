//! The webhook notifier: fires a best-effort notification for an
//! interruption event. A failed webhook must never block a drain.

use async_trait::async_trait;
use nth_types::InterruptionEvent;

#[async_trait]
pub trait WebhookNotifier: Send + Sync {
    async fn notify(&self, event: &InterruptionEvent);
}

pub struct NoopWebhookNotifier;

#[async_trait]
impl WebhookNotifier for NoopWebhookNotifier {
    async fn notify(&self, _event: &InterruptionEvent) {}
}
