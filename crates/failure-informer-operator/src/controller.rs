//! Shared controller plumbing
//!
//! Every reconciliation loop (Event, Notifier, FailureInformer, AppScaler)
//! runs as its own kube `Controller` and shares the pieces in this module:
//! the context, the metrics, the mapping from a pass result to a kube
//! [`Action`], and the error policy.
//!
//! At most one reconcile per object is in flight at any time; the kube
//! runtime serializes by object reference, so no keyed locking is needed
//! here. Different objects and different loops run concurrently and meet
//! only at the API server, where optimistic concurrency decides.

use crate::app_controller::run_app_controller;
use crate::config::OperatorConfig;
use crate::crd::{AppScaler, FailureInformer, Notifier};
use crate::dispatch::NotificationSink;
use crate::error::{OperatorError, Result};
use crate::event_controller::run_event_controller;
use crate::notifier_controller::run_notifier_controller;
use crate::store::{KubeStore, SharedStore};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Event, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a reconciliation pass asks of the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing left to do until the next change
    Done,
    /// Retry right away (after the short conflict delay)
    Requeue,
    /// Retry after waiting on dependent state
    RequeueAfter(Duration),
}

impl ReconcileAction {
    /// Translate into a kube runtime action
    pub fn into_action(self, config: &OperatorConfig) -> Action {
        match self {
            ReconcileAction::Done => Action::await_change(),
            ReconcileAction::Requeue => Action::requeue(config.conflict_requeue),
            ReconcileAction::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Turn a pass result into a decision.
///
/// Conflicts and transient store errors become [`ReconcileAction::Requeue`];
/// every other error is left for [`error_policy`].
pub fn decide(result: Result<ReconcileAction>) -> Result<ReconcileAction> {
    match result {
        Err(e) if e.requeues_immediately() => {
            debug!(error = %e, "Requeueing after retryable write failure");
            Ok(ReconcileAction::Requeue)
        }
        other => other,
    }
}

/// Store handles for every kind the loops read or write
#[derive(Clone)]
pub struct Stores {
    /// Cluster event records
    pub events: SharedStore<Event>,
    /// Notifier resources
    pub notifiers: SharedStore<Notifier>,
    /// Credential secrets
    pub secrets: SharedStore<Secret>,
    /// Replica sets
    pub replica_sets: SharedStore<ReplicaSet>,
}

impl Stores {
    /// Stores backed by the API server
    pub fn kube(client: Client) -> Self {
        Self {
            events: Arc::new(KubeStore::<Event>::new(client.clone())),
            notifiers: Arc::new(KubeStore::<Notifier>::new(client.clone())),
            secrets: Arc::new(KubeStore::<Secret>::new(client.clone())),
            replica_sets: Arc::new(KubeStore::<ReplicaSet>::new(client)),
        }
    }
}

/// Context passed to every reconcile of one controller
pub struct ControllerContext {
    /// Object access
    pub stores: Stores,
    /// Notification delivery backend
    pub sink: Arc<dyn NotificationSink>,
    /// Operator settings
    pub config: OperatorConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-object error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

impl ControllerContext {
    /// Create a context for the controller named `controller`
    pub fn new(
        stores: Stores,
        sink: Arc<dyn NotificationSink>,
        config: OperatorConfig,
        controller: &'static str,
    ) -> Self {
        Self {
            stores,
            sink,
            config,
            metrics: Some(ControllerMetrics::new(controller)),
            error_counts: dashmap::DashMap::new(),
        }
    }
}

/// Metrics for one controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Counter for passes that ended in an immediate requeue
    pub requeues: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Claims written onto events
    pub events_claimed: metrics::Counter,
    /// Stale claims removed from events
    pub claims_released: metrics::Counter,
    /// Notifiers skipped for an invalid filter or claim key
    pub filter_errors: metrics::Counter,
    /// Notifications handed to the sink
    pub notifications_delivered: metrics::Counter,
    /// Deliveries or releases that failed
    pub dispatch_failures: metrics::Counter,
    /// Child objects created or updated
    pub children_written: metrics::Counter,
}

impl ControllerMetrics {
    /// Create metrics labeled with the controller name
    pub fn new(controller: &'static str) -> Self {
        Self {
            reconciliations: metrics::counter!(
                "failure_informer_operator_reconciliations_total",
                "controller" => controller
            ),
            errors: metrics::counter!(
                "failure_informer_operator_reconciliation_errors_total",
                "controller" => controller
            ),
            requeues: metrics::counter!(
                "failure_informer_operator_requeues_total",
                "controller" => controller
            ),
            duration: metrics::histogram!(
                "failure_informer_operator_reconciliation_duration_seconds",
                "controller" => controller
            ),
            events_claimed: metrics::counter!(
                "failure_informer_operator_events_claimed_total",
                "controller" => controller
            ),
            claims_released: metrics::counter!(
                "failure_informer_operator_claims_released_total",
                "controller" => controller
            ),
            filter_errors: metrics::counter!(
                "failure_informer_operator_filter_errors_total",
                "controller" => controller
            ),
            notifications_delivered: metrics::counter!(
                "failure_informer_operator_notifications_delivered_total",
                "controller" => controller
            ),
            dispatch_failures: metrics::counter!(
                "failure_informer_operator_dispatch_failures_total",
                "controller" => controller
            ),
            children_written: metrics::counter!(
                "failure_informer_operator_children_written_total",
                "controller" => controller
            ),
        }
    }
}

/// Backoff key of an object
pub fn backoff_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Run one pass with timing, metrics, requeue mapping and backoff reset
pub async fn run_pass<F>(ctx: &ControllerContext, key: String, pass: F) -> Result<Action>
where
    F: Future<Output = Result<ReconcileAction>>,
{
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = decide(pass.await);

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(action) => {
            // Reset error backoff counter on success
            ctx.error_counts.remove(&key);
            if action == ReconcileAction::Requeue {
                if let Some(ref metrics) = ctx.metrics {
                    metrics.requeues.increment(1);
                }
            }
            Ok(action.into_action(&ctx.config))
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// Error policy shared by every controller.
///
/// Retryable errors back off exponentially per object; anything else is
/// logged and waits for the next change to the object.
pub fn error_policy<K: Resource>(
    obj: Arc<K>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = backoff_key(obj.as_ref());

    if !error.is_retryable() {
        ctx.error_counts.remove(&key);
        warn!(
            error = %error,
            "Reconciliation of '{}' failed, waiting for the next change",
            key
        );
        return Action::await_change();
    }

    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    let delay = ctx.config.error_backoff(retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

/// Log what the runtime reports for one reconcile
pub fn log_outcome<K, E>(kind: &str, result: std::result::Result<(ObjectRef<K>, Action), E>)
where
    K: Resource,
    E: Display,
{
    match result {
        Ok((obj, action)) => {
            debug!(
                kind,
                name = %obj.name,
                namespace = ?obj.namespace,
                ?action,
                "Reconciliation completed"
            );
        }
        Err(e) => {
            error!(kind, error = %e, "Reconciliation failed");
        }
    }
}

/// Api handle scoped to the watched namespace, or the whole cluster
pub fn watch_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run every reconciliation loop until they all stop
pub async fn run(client: Client, config: OperatorConfig, sink: Arc<dyn NotificationSink>) -> Result<()> {
    config.validate()?;
    let stores = Stores::kube(client.clone());

    let context = |name: &'static str| {
        Arc::new(ControllerContext::new(
            stores.clone(),
            sink.clone(),
            config.clone(),
            name,
        ))
    };

    info!(
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting controllers"
    );

    let (events, notifiers, informers, scalers) = tokio::join!(
        run_event_controller(client.clone(), context("event")),
        run_notifier_controller(client.clone(), context("notifier")),
        run_app_controller::<FailureInformer>(client.clone(), context("failureinformer")),
        run_app_controller::<AppScaler>(client, context("appscaler")),
    );
    events?;
    notifiers?;
    informers?;
    scalers?;

    info!("All controllers stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AppScalerSpec, NotifierSpec};
    use crate::dispatch::MemoryNotificationSink;
    use crate::store::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn memory_context() -> ControllerContext {
        let stores = Stores {
            events: Arc::new(MemoryStore::<Event>::new()),
            notifiers: Arc::new(MemoryStore::<Notifier>::new()),
            secrets: Arc::new(MemoryStore::<Secret>::new()),
            replica_sets: Arc::new(MemoryStore::<ReplicaSet>::new()),
        };
        ControllerContext::new(
            stores,
            Arc::new(MemoryNotificationSink::new()),
            OperatorConfig::default(),
            "test",
        )
    }

    fn app(name: &str) -> Arc<AppScaler> {
        Arc::new(AppScaler {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: AppScalerSpec {
                replicas: Some(1),
                image: "nginx".to_string(),
                command: vec![],
            },
            status: None,
        })
    }

    fn conflict() -> OperatorError {
        OperatorError::Conflict {
            kind: "Event".to_string(),
            name: "e".to_string(),
            message: "stale".to_string(),
        }
    }

    #[test]
    fn test_into_action() {
        let config = OperatorConfig::default();
        assert_eq!(
            ReconcileAction::Done.into_action(&config),
            Action::await_change()
        );
        assert_eq!(
            ReconcileAction::Requeue.into_action(&config),
            Action::requeue(Duration::from_millis(500))
        );
        assert_eq!(
            ReconcileAction::RequeueAfter(Duration::from_secs(10)).into_action(&config),
            Action::requeue(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_decide_requeues_conflicts_and_transients() {
        assert_eq!(decide(Err(conflict())).unwrap(), ReconcileAction::Requeue);
        assert_eq!(
            decide(Err(OperatorError::Transient("timeout".to_string()))).unwrap(),
            ReconcileAction::Requeue
        );
        assert!(decide(Err(OperatorError::ValidationError("bad".to_string()))).is_err());
        assert_eq!(
            decide(Ok(ReconcileAction::Done)).unwrap(),
            ReconcileAction::Done
        );
    }

    #[tokio::test]
    async fn test_run_pass_maps_conflict_to_requeue() {
        let ctx = memory_context();
        ctx.error_counts.insert("default/e".to_string(), 3);

        let action = run_pass(&ctx, "default/e".to_string(), async { Err(conflict()) })
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(ctx.config.conflict_requeue));
        assert!(!ctx.error_counts.contains_key("default/e"));
    }

    #[test]
    fn test_error_policy_backs_off() {
        let ctx = Arc::new(memory_context());
        let err = OperatorError::DeliveryFailed("smtp down".to_string());

        let first = error_policy(app("app1"), &err, ctx.clone());
        let second = error_policy(app("app1"), &err, ctx.clone());
        assert_eq!(first, Action::requeue(Duration::from_secs(30)));
        assert_eq!(second, Action::requeue(Duration::from_secs(60)));

        let other = error_policy(app("app2"), &err, ctx.clone());
        assert_eq!(other, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn test_error_policy_waits_on_permanent_errors() {
        let ctx = Arc::new(memory_context());
        let err = OperatorError::ValidationError("replicas: out of range".to_string());
        assert_eq!(error_policy(app("app1"), &err, ctx), Action::await_change());
    }

    #[test]
    fn test_backoff_key() {
        let notifier = Notifier {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                namespace: Some("ops".to_string()),
                ..Default::default()
            },
            spec: NotifierSpec {
                email: "a@b.io".to_string(),
                filters: vec![],
            },
            status: None,
        };
        assert_eq!(backoff_key(&notifier), "ops/n1");
    }
}
