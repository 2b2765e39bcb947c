//! End-to-end reconciliation scenarios against in-memory stores
//!
//! Each test wires the Event, Notifier and managed-application loops to a
//! shared set of `MemoryStore`s and drives them pass by pass, the way the
//! kube runtime would after each change notification.
//!
//! Run with: cargo test -p failure-informer-operator --test scenarios

use failure_informer_operator::controller::{run_pass, Stores};
use failure_informer_operator::marker::is_claimed_by;
use failure_informer_operator::prelude::*;
use failure_informer_operator::store::Fault;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetStatus};
use k8s_openapi::api::core::v1::{Event, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;

const NS: &str = "default";

/// In-memory cluster shared by every loop
struct Cluster {
    events: Arc<MemoryStore<Event>>,
    notifiers: Arc<MemoryStore<Notifier>>,
    secrets: Arc<MemoryStore<Secret>>,
    replica_sets: Arc<MemoryStore<ReplicaSet>>,
    sink: Arc<MemoryNotificationSink>,
    ctx: ControllerContext,
    ledger: CorrelationLedger,
}

impl Cluster {
    fn new() -> Self {
        let events = Arc::new(MemoryStore::<Event>::new());
        let notifiers = Arc::new(MemoryStore::<Notifier>::new());
        let secrets = Arc::new(MemoryStore::<Secret>::new());
        let replica_sets = Arc::new(MemoryStore::<ReplicaSet>::new());
        let sink = Arc::new(MemoryNotificationSink::new());

        let stores = Stores {
            events: events.clone(),
            notifiers: notifiers.clone(),
            secrets: secrets.clone(),
            replica_sets: replica_sets.clone(),
        };
        let ctx = ControllerContext::new(stores, sink.clone(), OperatorConfig::default(), "scenario");
        let ledger = CorrelationLedger::new(ctx.config.ledger_retention);

        Self {
            events,
            notifiers,
            secrets,
            replica_sets,
            sink,
            ctx,
            ledger,
        }
    }

    fn add_notifier(&self, name: &str, filters: &[&str]) -> Notifier {
        self.notifiers.insert(Notifier {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: NotifierSpec {
                email: format!("{}@example.com", name),
                filters: filters.iter().map(|f| f.to_string()).collect(),
            },
            status: None,
        })
    }

    fn add_event(&self, name: &str, severity: &str, reason: &str) -> Event {
        self.events.insert(Event {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            type_: Some(severity.to_string()),
            reason: Some(reason.to_string()),
            message: Some(format!("{} happened", reason)),
            involved_object: ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some("web-0".to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            count: Some(1),
            ..Default::default()
        })
    }

    fn event(&self, name: &str) -> Event {
        self.events.snapshot(NS, name).expect("event exists")
    }

    async fn event_pass(&self, name: &str) -> Action {
        run_pass(
            &self.ctx,
            format!("{}/{}", NS, name),
            correlate_event(&self.ctx, &self.ledger, NS, name),
        )
        .await
        .expect("event pass")
    }

    async fn notifier_pass(&self, notifier: &Notifier) -> Result<Action> {
        run_pass(
            &self.ctx,
            format!("{}/{}", NS, notifier.name_any()),
            reconcile_notifier(&self.ctx, notifier),
        )
        .await
    }

    async fn app_pass<A: ManagedApp>(&self, app: &A) -> Result<Action> {
        run_pass(
            &self.ctx,
            format!("{}/{}", NS, app.name_any()),
            reconcile_app(&self.ctx, app),
        )
        .await
    }

    fn conflict_action(&self) -> Action {
        Action::requeue(self.ctx.config.conflict_requeue)
    }
}

fn app_scaler(name: &str, image: &str, replicas: i32) -> AppScaler {
    AppScaler {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            uid: Some(format!("{}-uid", name)),
            ..Default::default()
        },
        spec: AppScalerSpec {
            replicas: Some(replicas),
            image: image.to_string(),
            command: vec![],
        },
        status: None,
    }
}

#[tokio::test]
async fn matching_warning_is_claimed_dispatched_once_and_released() {
    let cluster = Cluster::new();
    let n1 = cluster.add_notifier("n1", &["Fail.*"]);
    cluster.add_event("web-0.1", "Warning", "FailedMount");

    cluster.event_pass("web-0.1").await;
    let claimed = cluster.event("web-0.1");
    assert_eq!(claimed.labels().get("n1-notify"), Some(&"true".to_string()));

    cluster.notifier_pass(&n1).await.unwrap();
    let delivered = cluster.sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].recipient, "n1@example.com");
    assert_eq!(delivered[0].reason, "FailedMount");
    assert_eq!(delivered[0].involved_object, "web-0");

    let released = cluster.event("web-0.1");
    assert!(released.labels().get("n1-notify").is_none());

    // The release is itself a change; neither loop may notify again.
    cluster.event_pass("web-0.1").await;
    cluster.notifier_pass(&n1).await.unwrap();
    assert_eq!(cluster.sink.count(), 1);
    assert!(!is_claimed_by(&cluster.event("web-0.1"), &n1));
}

#[tokio::test]
async fn normal_event_never_acquires_a_claim() {
    let cluster = Cluster::new();
    let n1 = cluster.add_notifier("n1", &[".*"]);
    cluster.add_event("web-0.2", "Normal", "FailedMount");

    assert_eq!(cluster.event_pass("web-0.2").await, Action::await_change());
    cluster.notifier_pass(&n1).await.unwrap();

    assert!(cluster.event("web-0.2").labels().is_empty());
    assert_eq!(cluster.sink.count(), 0);
}

#[tokio::test]
async fn claim_iff_every_filter_matches() {
    let cluster = Cluster::new();
    let both = cluster.add_notifier("both", &["^Failed", "Mount$"]);
    let one = cluster.add_notifier("one", &["^Failed", "Scheduling$"]);
    let empty = cluster.add_notifier("empty", &[]);
    let broken = cluster.add_notifier("broken", &["Mount", "(("]);
    cluster.add_event("web-0.3", "Warning", "FailedMount");

    cluster.event_pass("web-0.3").await;
    let e = cluster.event("web-0.3");
    assert!(is_claimed_by(&e, &both));
    assert!(!is_claimed_by(&e, &one));
    assert!(!is_claimed_by(&e, &empty));
    assert!(!is_claimed_by(&e, &broken));
}

#[tokio::test]
async fn notifier_that_cannot_deliver_never_collects_claims() {
    let cluster = Cluster::new();
    cluster.add_notifier("n1", &["Fail.*"]);
    cluster.notifiers.modify(NS, "n1", |n| n.spec.email = "ops-team".to_string());
    let n1 = cluster.notifiers.snapshot(NS, "n1").expect("notifier exists");
    cluster.add_event("web-0.9", "Warning", "FailedMount");

    cluster.event_pass("web-0.9").await;
    let e = cluster.event("web-0.9");
    assert!(!is_claimed_by(&e, &n1));
    assert!(e.owner_references().is_empty());

    assert!(cluster.notifier_pass(&n1).await.is_err());
    assert_eq!(cluster.sink.count(), 0);
}

#[tokio::test]
async fn co_located_notifiers_release_independently() {
    let cluster = Cluster::new();
    let n1 = cluster.add_notifier("n1", &["Fail.*"]);
    let n2 = cluster.add_notifier("n2", &["Mount"]);
    cluster.add_event("web-0.4", "Warning", "FailedMount");

    cluster.event_pass("web-0.4").await;
    cluster.notifier_pass(&n1).await.unwrap();

    let e = cluster.event("web-0.4");
    assert!(!is_claimed_by(&e, &n1));
    assert!(is_claimed_by(&e, &n2));

    cluster.notifier_pass(&n2).await.unwrap();
    let recipients: Vec<String> = cluster
        .sink
        .delivered()
        .into_iter()
        .map(|n| n.recipient)
        .collect();
    assert_eq!(recipients, vec!["n1@example.com", "n2@example.com"]);
}

#[tokio::test]
async fn new_owner_gets_one_secret_and_one_replica_set() {
    let cluster = Cluster::new();
    let app1 = app_scaler("app1", "nginx", 3);

    let settle = Action::requeue(cluster.ctx.config.settle_requeue);
    assert_eq!(cluster.app_pass(&app1).await.unwrap(), settle);
    assert_eq!(cluster.secrets.len(), 1);
    assert_eq!(cluster.replica_sets.len(), 1);

    let rs = cluster.replica_sets.snapshot(NS, "app1").unwrap();
    assert_eq!(rs.spec.as_ref().unwrap().replicas, Some(3));
    assert_eq!(rs.owner_references()[0].uid, "app1-uid");

    // Pods come up
    cluster.replica_sets.modify(NS, "app1", |rs| {
        rs.status = Some(ReplicaSetStatus {
            replicas: 3,
            ready_replicas: Some(3),
            ..Default::default()
        });
    });
    assert_eq!(cluster.app_pass(&app1).await.unwrap(), Action::await_change());
    assert_eq!(
        observe_state(cluster.secrets.as_ref(), cluster.replica_sets.as_ref(), &app1)
            .await
            .unwrap(),
        OwnerState::Settled
    );
}

#[tokio::test]
async fn provisioning_twice_changes_nothing() {
    let cluster = Cluster::new();
    let app1 = app_scaler("app1", "nginx", 3);

    ensure_credential(cluster.secrets.as_ref(), &app1).await.unwrap();
    ensure_replica_set(cluster.replica_sets.as_ref(), &app1)
        .await
        .unwrap();
    let secret = cluster.secrets.snapshot(NS, "app1").unwrap();
    let rs = cluster.replica_sets.snapshot(NS, "app1").unwrap();

    ensure_credential(cluster.secrets.as_ref(), &app1).await.unwrap();
    ensure_replica_set(cluster.replica_sets.as_ref(), &app1)
        .await
        .unwrap();

    assert_eq!(cluster.secrets.snapshot(NS, "app1").unwrap(), secret);
    assert_eq!(cluster.replica_sets.snapshot(NS, "app1").unwrap(), rs);
    assert_eq!(cluster.secrets.create_count(), 1);
    assert_eq!(cluster.replica_sets.create_count(), 1);
    assert_eq!(cluster.replica_sets.replace_count(), 0);
}

#[tokio::test]
async fn conflict_on_claim_requeues() {
    let cluster = Cluster::new();
    let n1 = cluster.add_notifier("n1", &["Fail.*"]);
    cluster.add_event("web-0.5", "Warning", "FailedMount");

    cluster.events.fail_next_replace(Fault::Conflict);
    assert_eq!(cluster.event_pass("web-0.5").await, cluster.conflict_action());
    assert!(!is_claimed_by(&cluster.event("web-0.5"), &n1));

    cluster.event_pass("web-0.5").await;
    assert!(is_claimed_by(&cluster.event("web-0.5"), &n1));
}

#[tokio::test]
async fn conflict_on_release_requeues_and_redelivers() {
    let cluster = Cluster::new();
    let n1 = cluster.add_notifier("n1", &["Fail.*"]);
    cluster.add_event("web-0.6", "Warning", "FailedMount");
    cluster.event_pass("web-0.6").await;

    cluster.events.fail_next_replace(Fault::Conflict);
    assert_eq!(
        cluster.notifier_pass(&n1).await.unwrap(),
        cluster.conflict_action()
    );
    assert_eq!(cluster.sink.count(), 1);
    assert!(is_claimed_by(&cluster.event("web-0.6"), &n1));

    // At-least-once: the claim survived, so the event goes out again
    cluster.notifier_pass(&n1).await.unwrap();
    assert_eq!(cluster.sink.count(), 2);
    assert!(!is_claimed_by(&cluster.event("web-0.6"), &n1));
}

#[tokio::test]
async fn conflict_on_workload_update_requeues() {
    let cluster = Cluster::new();
    cluster
        .app_pass(&app_scaler("app1", "nginx", 3))
        .await
        .unwrap();

    cluster.replica_sets.fail_next_replace(Fault::Conflict);
    let scaled = app_scaler("app1", "nginx", 5);
    assert_eq!(
        cluster.app_pass(&scaled).await.unwrap(),
        cluster.conflict_action()
    );

    cluster.app_pass(&scaled).await.unwrap();
    let rs = cluster.replica_sets.snapshot(NS, "app1").unwrap();
    assert_eq!(rs.spec.unwrap().replicas, Some(5));
}

#[tokio::test]
async fn failed_delivery_keeps_claim_for_next_pass() {
    let cluster = Cluster::new();
    let n1 = cluster.add_notifier("n1", &["Fail.*"]);
    cluster.add_event("web-0.7", "Warning", "FailedMount");
    cluster.event_pass("web-0.7").await;

    cluster.sink.fail_next("smtp unavailable");
    let err = cluster.notifier_pass(&n1).await.unwrap_err();
    assert!(matches!(err, OperatorError::DeliveryFailed(_)));
    assert!(is_claimed_by(&cluster.event("web-0.7"), &n1));

    cluster.notifier_pass(&n1).await.unwrap();
    assert_eq!(cluster.sink.count(), 1);
}
