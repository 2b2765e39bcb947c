//! Notifier Controller
//!
//! Keeps each notifier's email credential Secret in place and dispatches
//! the events it has claimed. Besides notifier changes, the controller is
//! triggered by claimed events: every event carrying a notifier's claim
//! label and owner reference maps back to a reconcile of that notifier.

use crate::app_controller::convergence_action;
use crate::classifier::EVENT_FIELD_SELECTOR;
use crate::controller::{
    backoff_key, error_policy, log_outcome, run_pass, watch_api, ControllerContext,
    ReconcileAction,
};
use crate::crd::{claim_label_key, Notifier};
use crate::dispatch::dispatch_for;
use crate::error::Result;
use crate::marker::CLAIMED;
use crate::provision::{converge, ManagedApp};
use crate::resources::{LABEL_MANAGED_BY, MANAGED_BY};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Secret};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Notifiers that currently claim `event`
pub fn claiming_notifiers(event: &Event) -> Vec<ObjectRef<Notifier>> {
    let namespace = event.namespace();
    let kind = Notifier::kind(&());
    let api_version = Notifier::api_version(&());

    event
        .owner_references()
        .iter()
        .filter(|owner| owner.kind == kind && owner.api_version == api_version)
        .filter(|owner| {
            event
                .labels()
                .get(&claim_label_key(&owner.name))
                .is_some_and(|v| v == CLAIMED)
        })
        .map(|owner| {
            let obj = ObjectRef::new(&owner.name);
            match &namespace {
                Some(ns) => obj.within(ns),
                None => obj,
            }
        })
        .collect()
}

/// One pass for a notifier: provision its credential, then dispatch
pub async fn reconcile_notifier(
    ctx: &ControllerContext,
    notifier: &Notifier,
) -> Result<ReconcileAction> {
    notifier.validate_spec()?;

    let convergence = converge(
        ctx.stores.secrets.as_ref(),
        ctx.stores.replica_sets.as_ref(),
        notifier,
    )
    .await?;
    if convergence.changed {
        if let Some(ref metrics) = ctx.metrics {
            metrics.children_written.increment(1);
        }
    }

    let report = dispatch_for(ctx.stores.events.as_ref(), ctx.sink.as_ref(), notifier).await?;

    if let Some(ref metrics) = ctx.metrics {
        metrics
            .notifications_delivered
            .increment(report.delivered as u64);
        metrics
            .dispatch_failures
            .increment(report.failures.len() as u64);
    }

    if report.claimed > 0 {
        info!(
            claimed = report.claimed,
            delivered = report.delivered,
            released = report.released,
            failed = report.failures.len(),
            "Dispatched claimed events"
        );
    } else {
        debug!("No claimed events");
    }

    match report.into_error() {
        Some(error) => Err(error),
        None => Ok(convergence_action(&convergence, &ctx.config)),
    }
}

/// Main reconciliation function
#[instrument(skip(notifier, ctx), fields(name = %notifier.name_any(), namespace = notifier.namespace()))]
async fn reconcile(notifier: Arc<Notifier>, ctx: Arc<ControllerContext>) -> Result<Action> {
    run_pass(
        &ctx,
        backoff_key(notifier.as_ref()),
        reconcile_notifier(&ctx, &notifier),
    )
    .await
}

/// Start the Notifier controller
pub async fn run_notifier_controller(client: Client, ctx: Arc<ControllerContext>) -> Result<()> {
    let namespace = ctx.config.namespace.clone();
    let notifiers: Api<Notifier> = watch_api(&client, namespace.as_deref());
    let secrets: Api<Secret> = watch_api(&client, namespace.as_deref());
    let events: Api<Event> = watch_api(&client, namespace.as_deref());

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting Notifier controller"
    );

    let managed = format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY);

    Controller::new(notifiers, Config::default())
        .owns(secrets, Config::default().labels(&managed))
        .watches(
            events,
            Config::default().fields(EVENT_FIELD_SELECTOR),
            |event| claiming_notifiers(&event),
        )
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move { log_outcome("Notifier", result) })
        .await;

    Ok(())
}
