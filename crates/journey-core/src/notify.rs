//! Notification hook
//!
//! The engine queues notifications inside a transaction and hands them to a
//! [`Notifier`] only after the commit. Delivery failures are retried and then
//! logged; they never fail the originating call.

use crate::collab::HookError;
use crate::types::{ReviewDecision, UserId};
use chrono::{DateTime, Utc};
use crossbeam::channel::{Receiver, Sender};
use journey_playbook::{NodeId, TenantId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Who receives a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Recipient {
    User(UserId),
    /// Tenant-wide admin visibility feed
    AdminChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DocumentReviewed,
    SubmissionReceived,
    StateChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub tenant_id: TenantId,
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub student_id: UserId,
    pub node_id: NodeId,
    pub created_at: DateTime<Utc>,
}

/// Review decision summary sent to the student
#[must_use]
pub(crate) fn review_message(decision: ReviewDecision, note: Option<&str>) -> String {
    match decision {
        ReviewDecision::Approved | ReviewDecision::ApprovedWithComments => {
            "Your document has been approved.".to_string()
        }
        ReviewDecision::Rejected => match note.filter(|n| !n.trim().is_empty()) {
            Some(note) => format!("Changes requested for your document. Note: {note}"),
            None => "Changes requested for your document.".to_string(),
        },
        ReviewDecision::Submitted => "Your document has been reviewed.".to_string(),
    }
}

#[must_use]
pub(crate) fn review_title(filename: &str) -> String {
    format!("Document Reviewed: {filename}")
}

/// Delivery sink
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), HookError>;
}

/// Logs every notification at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), HookError> {
        tracing::info!(
            tenant = %notification.tenant_id,
            recipient = ?notification.recipient,
            kind = ?notification.kind,
            title = %notification.title,
            "notification"
        );
        Ok(())
    }
}

/// Keeps delivered notifications in memory; can be told to fail
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Notification>>,
    failures: Mutex<u32>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` deliveries
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock() = n;
    }

    #[must_use]
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }

    #[must_use]
    pub fn delivered_to(&self, recipient: Recipient) -> Vec<Notification> {
        self.delivered
            .lock()
            .iter()
            .filter(|n| n.recipient == recipient)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.delivered.lock().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), HookError> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(HookError::new("delivery rejected"));
        }
        self.delivered.lock().push(notification.clone());
        Ok(())
    }
}

/// Forwards notifications to a crossbeam channel for an external worker
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: Sender<Notification>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new(sender: Sender<Notification>) -> Self {
        Self { sender }
    }

    /// Notifier plus the receiving end of an unbounded channel
    #[must_use]
    pub fn unbounded() -> (Self, Receiver<Notification>) {
        let (sender, receiver) = crossbeam::channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), HookError> {
        self.sender
            .send(notification.clone())
            .map_err(|_| HookError::new("notification channel closed"))
    }
}

/// Deliver with `retries` extra attempts; failures are logged only
pub(crate) fn dispatch(notifier: &dyn Notifier, outbox: &[Notification], retries: u32) {
    for notification in outbox {
        let mut attempt = 0;
        loop {
            match notifier.notify(notification) {
                Ok(()) => break,
                Err(err) if attempt < retries => {
                    attempt += 1;
                    tracing::debug!(error = %err, attempt, "retrying notification");
                }
                Err(err) => {
                    tracing::warn!(
                        tenant = %notification.tenant_id,
                        recipient = ?notification.recipient,
                        title = %notification.title,
                        error = %err,
                        "notification dropped"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Notification {
        Notification {
            tenant_id: TenantId::new(),
            recipient: Recipient::AdminChannel,
            kind: NotificationKind::SubmissionReceived,
            title: "t".into(),
            message: "m".into(),
            student_id: UserId::new(),
            node_id: NodeId::new("A"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn messages() {
        assert_eq!(review_title("f.pdf"), "Document Reviewed: f.pdf");
        assert_eq!(
            review_message(ReviewDecision::Approved, Some("LGTM")),
            "Your document has been approved."
        );
        assert_eq!(
            review_message(ReviewDecision::Rejected, Some("fix refs")),
            "Changes requested for your document. Note: fix refs"
        );
        assert_eq!(
            review_message(ReviewDecision::Submitted, None),
            "Your document has been reviewed."
        );
    }

    #[test]
    fn dispatch_retries_then_delivers() {
        let notifier = RecordingNotifier::new();
        notifier.fail_next(1);
        dispatch(&notifier, &[sample()], 1);
        assert_eq!(notifier.delivered().len(), 1);
    }

    #[test]
    fn dispatch_gives_up_quietly() {
        let notifier = RecordingNotifier::new();
        notifier.fail_next(5);
        dispatch(&notifier, &[sample()], 1);
        assert!(notifier.delivered().is_empty());
    }

    #[test]
    fn channel_notifier_forwards() {
        let (notifier, receiver) = ChannelNotifier::unbounded();
        notifier.notify(&sample()).unwrap();
        assert_eq!(receiver.try_recv().unwrap().title, "t");
    }
}
