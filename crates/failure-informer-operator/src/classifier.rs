//! Event classification
//!
//! Decides whether a cluster event is a notification candidate at all,
//! before any notifier filter is consulted.

use k8s_openapi::api::core::v1::Event;

/// Event type that makes an event a candidate
pub const WARNING_TYPE: &str = "Warning";

/// Involved-object kind that makes an event a candidate
pub const POD_KIND: &str = "Pod";

/// Field selector applied to the event watch so that non-candidates are not
/// delivered in the first place
pub const EVENT_FIELD_SELECTOR: &str = "type=Warning,involvedObject.kind=Pod";

/// Outcome of classifying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Warning event about a pod
    Relevant,
    /// Severity is not `Warning`
    NotWarning,
    /// Involved object is not a pod
    NotPod,
}

impl Classification {
    /// Whether the event should be correlated
    pub fn is_relevant(self) -> bool {
        self == Classification::Relevant
    }
}

/// Classify an event. Severity is checked before the involved object kind.
pub fn classify(event: &Event) -> Classification {
    if event.type_.as_deref() != Some(WARNING_TYPE) {
        return Classification::NotWarning;
    }
    if event.involved_object.kind.as_deref() != Some(POD_KIND) {
        return Classification::NotPod;
    }
    Classification::Relevant
}

/// Reason string the filters are matched against
pub fn event_reason(event: &Event) -> &str {
    event.reason.as_deref().unwrap_or_default()
}

/// Occurrence counter of an event.
///
/// The API server bumps `count` (or `series.count` for new-style events)
/// every time it folds a recurrence into an existing event object.
pub fn occurrence(event: &Event) -> i32 {
    event
        .series
        .as_ref()
        .and_then(|s| s.count)
        .or(event.count)
        .unwrap_or(1)
}
