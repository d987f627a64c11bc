//! Fire-and-forget user notifications sent after a unit of work commits.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::model::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Enrollment,
    Deposit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub account_id: AccountId,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub link: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Delivery transport. Failures are logged by callers and never roll back
/// the operation that triggered the notification.
pub trait Notifier: Send + Sync + 'static {
    fn notify(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>>;
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                account_id = %notification.account_id,
                kind = ?notification.kind,
                title = %notification.title,
                "notification"
            );
            Ok(())
        })
    }
}

/// Send `notification` and swallow any failure with a warning.
pub(crate) async fn send_best_effort(notifier: &dyn Notifier, notification: Notification) {
    let account_id = notification.account_id;
    let kind = notification.kind;
    if let Err(e) = notifier.notify(notification).await {
        tracing::warn!(
            error = %e,
            %account_id,
            ?kind,
            "failed to deliver notification"
        );
    }
}

// =============================================================================
// Mock: RecordingNotifier (test / testing feature)
// =============================================================================

#[cfg(any(test, feature = "testing"))]
pub use recording::RecordingNotifier;

#[cfg(any(test, feature = "testing"))]
mod recording {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        /// Whether deliveries should fail.
        pub should_fail: bool,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                should_fail: true,
            }
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(
            &self,
            notification: Notification,
        ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
            if self.should_fail {
                return Box::pin(async { Err(NotifyError::Delivery("mock failure".to_string())) });
            }
            self.sent.lock().push(notification);
            Box::pin(async { Ok(()) })
        }
    }
}
