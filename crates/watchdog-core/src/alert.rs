use crate::models::Alert;
use async_trait::async_trait;

/// A destination for alert notifications.
///
/// Implementations report failure through the return value and never error;
/// a failed delivery must not interrupt the pass that raised the alert.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, subject: &str, body: &str) -> bool;

    async fn deliver_alert(&self, alert: &Alert) -> bool {
        self.deliver(&alert.subject(), &alert.body()).await
    }
}
