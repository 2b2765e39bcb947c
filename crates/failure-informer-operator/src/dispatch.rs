//! Notification dispatch
//!
//! For one notifier, every event in its namespace that carries the
//! notifier's claim label is turned into a [`Notification`], handed to the
//! [`NotificationSink`], and then released.
//!
//! Delivery is at-least-once. A failed delivery leaves the claim in place,
//! and so does a failed release after a successful delivery: the next pass
//! will deliver that event again.

use crate::classifier::event_reason;
use crate::crd::Notifier;
use crate::error::{OperatorError, Result};
use crate::marker::{claim_key, release_persisted, CLAIMED};
use crate::store::{LabelMatch, ObjectStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Payload handed to the delivery backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Recipient address
    pub recipient: String,
    /// Notifier that claimed the event
    pub notifier: String,
    /// Namespace of the event and the notifier
    pub namespace: String,
    /// Name of the event object
    pub event: String,
    /// Event reason, e.g. `FailedMount`
    pub reason: String,
    /// Human-readable event message
    pub message: String,
    /// Name of the pod the event is about
    pub involved_object: String,
    /// When the event was last observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Notification {
    /// Build the payload for a claimed event
    pub fn from_event(notifier: &Notifier, event: &Event) -> Self {
        let last_seen = event
            .last_timestamp
            .as_ref()
            .map(|t| t.0)
            .or_else(|| event.event_time.as_ref().map(|t| t.0));

        Self {
            recipient: notifier.email().to_string(),
            notifier: notifier.name_any(),
            namespace: event.namespace().unwrap_or_default(),
            event: event.name_any(),
            reason: event_reason(event).to_string(),
            message: event.message.clone().unwrap_or_default(),
            involved_object: event.involved_object.name.clone().unwrap_or_default(),
            last_seen,
        }
    }

    /// One-line subject for mail-style backends
    pub fn subject(&self) -> String {
        format!(
            "[{}] {} on pod {}",
            self.namespace, self.reason, self.involved_object
        )
    }
}

/// Delivery backend for notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Sink that writes each notification as a structured log record
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            recipient = %notification.recipient,
            notifier = %notification.notifier,
            namespace = %notification.namespace,
            reason = %notification.reason,
            message = %notification.message,
            pod = %notification.involved_object,
            subject = %notification.subject(),
            "Email sent"
        );
        Ok(())
    }
}

/// Sink that records notifications in memory, with injectable failures
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    delivered: Mutex<Vec<Notification>>,
    failures: Mutex<VecDeque<String>>,
}

impl MemoryNotificationSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, in order
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }

    /// Number of deliveries so far
    pub fn count(&self) -> usize {
        self.delivered.lock().len()
    }

    /// Fail the next delivery with `reason`
    pub fn fail_next(&self, reason: impl Into<String>) {
        self.failures.lock().push_back(reason.into());
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        if let Some(reason) = self.failures.lock().pop_front() {
            return Err(OperatorError::DeliveryFailed(reason));
        }
        self.delivered.lock().push(notification.clone());
        Ok(())
    }
}

/// What one dispatch pass did
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Claimed events found
    pub claimed: usize,
    /// Notifications delivered
    pub delivered: usize,
    /// Claims released after delivery
    pub released: usize,
    /// Per-event failures (event name, error); those claims are still set
    pub failures: Vec<(String, OperatorError)>,
}

impl DispatchReport {
    /// Whether every claimed event was delivered and released
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse the failures into the error that decides the requeue.
    ///
    /// Conflicts and transient errors win, since they resolve with an
    /// immediate retry.
    pub fn into_error(self) -> Option<OperatorError> {
        let mut first = None;
        for (_, error) in self.failures {
            if error.requeues_immediately() {
                return Some(error);
            }
            first.get_or_insert(error);
        }
        first
    }
}

/// Deliver and release every event claimed by `notifier`.
///
/// Failures on one event do not stop the others; they are collected in the
/// report. Only failing to list the claimed events is an error here.
pub async fn dispatch_for(
    events: &dyn ObjectStore<Event>,
    sink: &dyn NotificationSink,
    notifier: &Notifier,
) -> Result<DispatchReport> {
    let namespace = notifier.namespace().ok_or_else(|| {
        OperatorError::ValidationError(format!(
            "notifier {} has no namespace",
            notifier.name_any()
        ))
    })?;
    let key = claim_key(notifier)?;
    let claimed = events
        .list(&namespace, &LabelMatch::eq(key, CLAIMED))
        .await?;

    let mut report = DispatchReport {
        claimed: claimed.len(),
        ..Default::default()
    };

    for event in claimed {
        let notification = Notification::from_event(notifier, &event);
        if let Err(e) = sink.deliver(&notification).await {
            warn!(
                notifier = %notifier.name_any(),
                event = %event.name_any(),
                error = %e,
                "Delivery failed, keeping claim"
            );
            report.failures.push((event.name_any(), e));
            continue;
        }
        report.delivered += 1;

        match release_persisted(events, &event, notifier).await {
            Ok(_) => report.released += 1,
            Err(e) => {
                warn!(
                    notifier = %notifier.name_any(),
                    event = %event.name_any(),
                    error = %e,
                    "Release failed after delivery, event will be delivered again"
                );
                report.failures.push((event.name_any(), e));
            }
        }
    }

    Ok(report)
}
