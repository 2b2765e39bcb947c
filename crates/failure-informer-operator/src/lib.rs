//! # Failure Informer Kubernetes Operator
//!
//! Kubernetes operator that correlates warning-level pod events with
//! `Notifier` resources and provisions the children of `FailureInformer`
//! and `AppScaler` resources.
//!
//! ## Features
//!
//! - **Event correlation**: every `Warning` event about a pod is matched
//!   against the regex filters of each notifier in its namespace; matching
//!   notifiers claim the event with a `<notifier>-notify: "true"` label
//! - **Notification dispatch**: claimed events are handed to a
//!   [`NotificationSink`](dispatch::NotificationSink) and then released,
//!   with at-least-once delivery
//! - **Child provisioning**: idempotent get-or-create of a credential
//!   Secret and a ReplicaSet per owner, with drift correction
//! - **Optimistic concurrency**: conflicting writes are requeued, never
//!   treated as fatal
//! - **Observability**: Prometheus-compatible operator metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use failure_informer_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run(client, OperatorConfig::default(), Arc::new(LogNotificationSink)).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Four independent loops, each a kube `Controller`:
//!
//! 1. **Event**: classify, match filters, write the claim set
//! 2. **Notifier**: provision the email Secret, dispatch and release claims
//! 3. **FailureInformer** / **AppScaler**: converge Secret and ReplicaSet
//!
//! Owner state (`Unprovisioned → CredentialProvisioned →
//! WorkloadProvisioned → Settled`) is never stored; each pass infers it
//! from the children that exist.
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`classifier`] - Event relevance check
//! - [`filter`] - Notifier filter matching
//! - [`marker`] - Claim labels and owner references on events
//! - [`resources`] - Secret and ReplicaSet builders
//! - [`provision`] - Owner convergence
//! - [`dispatch`] - Notification payloads and delivery
//! - [`store`] - Object store abstraction (API server or in memory)
//! - [`controller`] - Shared context, metrics and error policy
//! - [`event_controller`], [`notifier_controller`], [`app_controller`] - The loops
//! - [`config`] - Operator settings
//! - [`error`] - Error types for operator operations
//!
//! ## Custom Resource Definitions
//!
//! ```yaml
//! apiVersion: failure-informer.io/v1
//! kind: Notifier
//! metadata:
//!   name: n1
//! spec:
//!   email: ops@example.com
//!   filters: ["Fail.*"]
//! ---
//! apiVersion: failure-informer.io/v1beta1
//! kind: AppScaler
//! metadata:
//!   name: app1
//! spec:
//!   image: nginx
//!   replicas: 3
//! ```
//!
//! ## Metrics
//!
//! All metrics carry a `controller` label:
//!
//! - `failure_informer_operator_reconciliations_total`
//! - `failure_informer_operator_reconciliation_errors_total`
//! - `failure_informer_operator_reconciliation_duration_seconds`
//! - `failure_informer_operator_events_claimed_total`
//! - `failure_informer_operator_notifications_delivered_total`
//! - `failure_informer_operator_filter_errors_total`

pub mod app_controller;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod crd;
pub mod dispatch;
pub mod error;
pub mod event_controller;
pub mod filter;
pub mod marker;
pub mod notifier_controller;
pub mod provision;
pub mod resources;
pub mod store;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::app_controller::{reconcile_app, run_app_controller};
    pub use crate::classifier::{classify, Classification};
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{
        decide, run, ControllerContext, ControllerMetrics, ReconcileAction, Stores,
    };
    pub use crate::crd::{
        AppScaler, AppScalerSpec, FailureInformer, FailureInformerSpec, Notifier, NotifierSpec,
    };
    pub use crate::dispatch::{
        dispatch_for, DispatchReport, LogNotificationSink, MemoryNotificationSink, Notification,
        NotificationSink,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::event_controller::{correlate_event, run_event_controller, CorrelationLedger};
    pub use crate::filter::FilterSet;
    pub use crate::marker::{claim, release};
    pub use crate::notifier_controller::{reconcile_notifier, run_notifier_controller};
    pub use crate::provision::{
        converge, ensure_credential, ensure_replica_set, observe_state, ManagedApp, OwnerState,
    };
    pub use crate::resources::ResourceBuilder;
    pub use crate::store::{KubeStore, LabelMatch, MemoryStore, ObjectStore};
}
