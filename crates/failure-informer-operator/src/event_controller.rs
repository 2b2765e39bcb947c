//! Event Controller
//!
//! Correlates warning-level pod events with the notifiers of their
//! namespace. One pass re-reads the event, classifies it, matches the
//! reason against every notifier's filters and writes the resulting claim
//! set back in a single conditional replace: claims are added for matching
//! notifiers and removed for notifiers that no longer match.
//!
//! The Notifier controller releases claims after delivery, which changes
//! the event and triggers this controller again. The [`CorrelationLedger`]
//! remembers which occurrence of each event was already correlated so a
//! released event is not claimed a second time. When the API server folds
//! a recurrence into the event (`count` goes up), the event is correlated
//! again.

use crate::classifier::{classify, event_reason, occurrence, EVENT_FIELD_SELECTOR};
use crate::controller::{
    backoff_key, error_policy, log_outcome, run_pass, watch_api, ControllerContext,
    ReconcileAction,
};
use crate::crd::Notifier;
use crate::error::Result;
use crate::filter::partition;
use crate::marker::{claim_key, is_claimed_by, notifier_owner_reference, reconcile_claims};
use crate::provision::ManagedApp;
use crate::store::LabelMatch;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Longest wait between two sweeps of expired ledger entries
pub const MAX_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    occurrence: i32,
    recorded: Instant,
}

/// Occurrences of events that were already correlated, keyed by event uid
#[derive(Debug)]
pub struct CorrelationLedger {
    entries: DashMap<String, LedgerEntry>,
    retention: Duration,
    last_prune: Mutex<Instant>,
}

impl CorrelationLedger {
    /// Create an empty ledger that forgets entries after `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
            last_prune: Mutex::new(Instant::now()),
        }
    }

    /// Whether this occurrence (or a later one) was already correlated
    pub fn is_correlated(&self, key: &str, occurrence: i32) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.occurrence >= occurrence)
    }

    /// Remember that `occurrence` was correlated
    pub fn record(&self, key: impl Into<String>, occurrence: i32) {
        self.entries.insert(
            key.into(),
            LedgerEntry {
                occurrence,
                recorded: Instant::now(),
            },
        );
    }

    /// Drop entries older than the retention window
    pub fn prune(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.recorded.elapsed() < self.retention);
        before - self.entries.len()
    }

    /// Sweep expired entries when the last sweep is older than the prune
    /// interval (the retention, at most [`MAX_PRUNE_INTERVAL`])
    pub fn prune_if_due(&self) -> usize {
        {
            let mut last = self.last_prune.lock();
            if last.elapsed() < self.retention.min(MAX_PRUNE_INTERVAL) {
                return 0;
            }
            *last = Instant::now();
        }
        self.prune()
    }

    /// Number of remembered events
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ledger key of an event: its uid, or namespace/name before it has one
pub fn ledger_key(event: &Event) -> String {
    event.uid().unwrap_or_else(|| backoff_key(event))
}

/// One correlation pass for the event `namespace/name`
pub async fn correlate_event(
    ctx: &ControllerContext,
    ledger: &CorrelationLedger,
    namespace: &str,
    name: &str,
) -> Result<ReconcileAction> {
    let pruned = ledger.prune_if_due();
    if pruned > 0 {
        debug!(pruned, "Pruned correlation ledger");
    }

    // The watch cache may be stale; decide on the current object
    let Some(event) = ctx.stores.events.get(namespace, name).await? else {
        debug!("Event is gone");
        return Ok(ReconcileAction::Done);
    };

    let classification = classify(&event);
    if !classification.is_relevant() {
        debug!(?classification, "Ignoring event");
        return Ok(ReconcileAction::Done);
    }

    let key = ledger_key(&event);
    let seen = occurrence(&event);
    if ledger.is_correlated(&key, seen) {
        debug!(occurrence = seen, "Occurrence already correlated");
        return Ok(ReconcileAction::Done);
    }

    let notifiers = ctx
        .stores
        .notifiers
        .list(namespace, &LabelMatch::everything())
        .await?;
    let reason = event_reason(&event);
    let report = partition(&notifiers, reason);

    for (notifier, error) in &report.invalid {
        warn!(notifier = %notifier.name_any(), error = %error, "Skipping notifier with invalid filter");
        if let Some(ref metrics) = ctx.metrics {
            metrics.filter_errors.increment(1);
        }
    }

    // A notifier that cannot dispatch must not hold claims.
    let mut claim_for: Vec<&Notifier> = Vec::with_capacity(report.matched.len());
    let mut skipped: Vec<&Notifier> = Vec::new();
    for notifier in report.matched {
        let eligible = notifier
            .validate_spec()
            .and_then(|_| claim_key(notifier))
            .and_then(|_| notifier_owner_reference(notifier));
        match eligible {
            Ok(_) => claim_for.push(notifier),
            Err(error) => {
                warn!(notifier = %notifier.name_any(), error = %error, "Skipping notifier that cannot claim");
                if let Some(ref metrics) = ctx.metrics {
                    metrics.filter_errors.increment(1);
                }
                skipped.push(notifier);
            }
        }
    }

    let release_for: Vec<&Notifier> = report
        .unmatched
        .into_iter()
        .chain(report.invalid.iter().map(|(notifier, _)| *notifier))
        .chain(skipped)
        .filter(|notifier| is_claimed_by(&event, notifier))
        .collect();

    let new_claims = claim_for
        .iter()
        .filter(|notifier| !is_claimed_by(&event, notifier))
        .count();

    if let Some(updated) = reconcile_claims(&event, &claim_for, &release_for)? {
        ctx.stores.events.replace(&updated).await?;
        info!(
            reason,
            claimed = new_claims,
            released = release_for.len(),
            "Updated event claims"
        );
        if let Some(ref metrics) = ctx.metrics {
            metrics.events_claimed.increment(new_claims as u64);
            metrics.claims_released.increment(release_for.len() as u64);
        }
    } else {
        debug!(reason, "Event claims already up to date");
    }

    ledger.record(key, seen);
    Ok(ReconcileAction::Done)
}

/// Main reconciliation function
#[instrument(skip(event, ctx, ledger), fields(name = %event.name_any(), namespace = event.namespace()))]
async fn reconcile(
    event: Arc<Event>,
    ctx: Arc<ControllerContext>,
    ledger: Arc<CorrelationLedger>,
) -> Result<Action> {
    let namespace = event.namespace().unwrap_or_default();
    let name = event.name_any();
    run_pass(
        &ctx,
        backoff_key(event.as_ref()),
        correlate_event(&ctx, &ledger, &namespace, &name),
    )
    .await
}

/// Start the Event controller
pub async fn run_event_controller(client: Client, ctx: Arc<ControllerContext>) -> Result<()> {
    let namespace = ctx.config.namespace.clone();
    let events: Api<Event> = watch_api(&client, namespace.as_deref());

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        selector = EVENT_FIELD_SELECTOR,
        "Starting Event controller"
    );

    let ledger = Arc::new(CorrelationLedger::new(ctx.config.ledger_retention));

    Controller::new(events, Config::default().fields(EVENT_FIELD_SELECTOR))
        .run(
            move |event, ctx| reconcile(event, ctx, ledger.clone()),
            error_policy,
            ctx,
        )
        .for_each(|result| async move { log_outcome("Event", result) })
        .await;

    Ok(())
}
