//! Managed application controllers
//!
//! FailureInformer and AppScaler run the same loop: validate the spec,
//! converge the credential Secret and the ReplicaSet, and come back until
//! the replica set reports every pod ready.

use crate::config::OperatorConfig;
use crate::controller::{
    backoff_key, error_policy, log_outcome, run_pass, watch_api, ControllerContext,
    ReconcileAction,
};
use crate::error::Result;
use crate::provision::{converge, Convergence, ManagedApp};
use crate::resources::{LABEL_MANAGED_BY, MANAGED_BY};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Next step after a convergence pass
pub fn convergence_action(convergence: &Convergence, config: &OperatorConfig) -> ReconcileAction {
    if convergence.is_settled() {
        ReconcileAction::Done
    } else {
        ReconcileAction::RequeueAfter(config.settle_requeue)
    }
}

/// One pass for a managed application
pub async fn reconcile_app<A: ManagedApp>(
    ctx: &ControllerContext,
    app: &A,
) -> Result<ReconcileAction> {
    app.validate_spec()?;

    let convergence = converge(
        ctx.stores.secrets.as_ref(),
        ctx.stores.replica_sets.as_ref(),
        app,
    )
    .await?;

    if convergence.changed {
        if let Some(ref metrics) = ctx.metrics {
            metrics.children_written.increment(1);
        }
        info!(
            observed = %convergence.observed,
            state = %convergence.state,
            "Converged children"
        );
    } else {
        debug!(state = %convergence.state, "Children up to date");
    }

    Ok(convergence_action(&convergence, &ctx.config))
}

/// Main reconciliation function
#[instrument(skip(app, ctx), fields(name = %app.name_any(), namespace = app.namespace()))]
async fn reconcile<A: ManagedApp>(app: Arc<A>, ctx: Arc<ControllerContext>) -> Result<Action> {
    run_pass(&ctx, backoff_key(app.as_ref()), reconcile_app(&ctx, app.as_ref())).await
}

/// Start the controller for one managed application kind
pub async fn run_app_controller<A>(client: Client, ctx: Arc<ControllerContext>) -> Result<()>
where
    A: ManagedApp
        + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + 'static,
{
    let namespace = ctx.config.namespace.clone();
    let apps: Api<A> = watch_api(&client, namespace.as_deref());
    let replica_sets: Api<ReplicaSet> = watch_api(&client, namespace.as_deref());
    let secrets: Api<Secret> = watch_api(&client, namespace.as_deref());
    let kind = A::kind(&()).to_string();

    info!(
        kind = %kind,
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting controller"
    );

    let managed = format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY);

    Controller::new(apps, Config::default())
        .owns(replica_sets, Config::default().labels(&managed))
        .owns(secrets, Config::default().labels(&managed))
        .run(reconcile::<A>, error_policy::<A>, ctx)
        .for_each(|result| {
            let kind = kind.clone();
            async move { log_outcome(&kind, result) }
        })
        .await;

    Ok(())
}
