//! Notification sink used by escalations and notification/approval steps.
//!
//! Delivery is send-and-forget: the engine only learns whether the notifier
//! accepted the message. `Notifier` uses RPITIT; `BoxNotifier` provides the
//! object-safe wrapper the engine stores (same blanket-impl pattern as the
//! step handlers).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mitigate_types::escalation::NotificationChannel;
use serde::Serialize;
use uuid::Uuid;

/// One outgoing notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub execution_id: Uuid,
    pub instruction_id: String,
    pub channel: NotificationChannel,
    /// Roles addressed by the message.
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Escalation rank, for escalation notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Delivery port for notifications.
pub trait Notifier: Send + Sync {
    fn send(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Object-safe version of [`Notifier`] with boxed futures.
pub trait NotifierDyn: Send + Sync {
    fn send_boxed<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;
}

impl<T: Notifier> NotifierDyn for T {
    fn send_boxed<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>> {
        Box::pin(self.send(notification))
    }
}

/// Type-erased, cheaply clonable notifier.
#[derive(Clone)]
pub struct BoxNotifier {
    inner: Arc<dyn NotifierDyn>,
}

impl BoxNotifier {
    pub fn new<T: Notifier + 'static>(notifier: T) -> Self {
        Self {
            inner: Arc::new(notifier),
        }
    }

    pub async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.inner.send_boxed(notification).await
    }
}

impl Default for BoxNotifier {
    fn default() -> Self {
        Self::new(TracingNotifier)
    }
}

impl std::fmt::Debug for BoxNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNotifier").finish_non_exhaustive()
    }
}

/// Notifier that writes every message to the log. The default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            execution_id = %notification.execution_id,
            instruction_id = %notification.instruction_id,
            channel = %notification.channel,
            recipients = ?notification.recipients,
            level = ?notification.level,
            subject = %notification.subject,
            "notification sent"
        );
        Ok(())
    }
}
