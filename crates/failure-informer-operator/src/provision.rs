//! Child-object provisioning for owner resources
//!
//! Every owner kind (Notifier, FailureInformer, AppScaler) is driven by the
//! same convergence algorithm, parameterized by the [`ManagedApp`]
//! capability trait. An owner moves through
//! `Unprovisioned → CredentialProvisioned → WorkloadProvisioned → Settled`,
//! and the state is never stored: each pass infers it from which child
//! objects exist and what the replica set reports.

use crate::crd::{describe_validation_errors, AppScaler, FailureInformer, Notifier};
use crate::error::{OperatorError, Result};
use crate::resources::{has_drifted, is_ready, OwnerIdentity, ResourceBuilder, WorkloadTemplate};
use crate::store::ObjectStore;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};
use validator::Validate;

/// Replica count used when an owner declares none
pub const DEFAULT_REPLICAS: i32 = 1;

/// Annotation kubectl writes on applied objects; never copied to children
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Capabilities the convergence algorithm needs from an owner kind
pub trait ManagedApp: Resource<DynamicType = ()> + Sized + Send + Sync {
    /// Validate the declared spec
    fn validate_spec(&self) -> Result<()>;

    /// Annotation set stamped on the credential and on the workload pods
    fn credential_annotations(&self) -> BTreeMap<String, String>;

    /// Declared workload, or `None` when the kind runs no pods
    fn workload_template(&self) -> Option<WorkloadTemplate>;

    /// Identity and controller reference handed to child objects
    fn identity(&self) -> Result<OwnerIdentity> {
        let kind = Self::kind(&()).to_string();
        let name = self.name_any();
        let namespace = self.namespace().ok_or_else(|| {
            OperatorError::ValidationError(format!("{} {} has no namespace", kind, name))
        })?;
        let owner_reference = self.controller_owner_ref(&()).ok_or_else(|| {
            OperatorError::ValidationError(format!("{} {} has no uid yet", kind, name))
        })?;
        Ok(OwnerIdentity {
            kind,
            name,
            namespace,
            owner_reference,
        })
    }
}

fn spec_error(kind: &str, name: &str, errors: &validator::ValidationErrors) -> OperatorError {
    OperatorError::ValidationError(format!(
        "{} {}: {}",
        kind,
        name,
        describe_validation_errors(errors)
    ))
}

impl ManagedApp for Notifier {
    fn validate_spec(&self) -> Result<()> {
        self.spec
            .validate()
            .map_err(|e| spec_error("Notifier", &self.name_any(), &e))
    }

    /// The notifier's own annotations, minus kubectl bookkeeping
    fn credential_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = self.annotations().clone();
        annotations.remove(LAST_APPLIED_ANNOTATION);
        annotations
    }

    fn workload_template(&self) -> Option<WorkloadTemplate> {
        None
    }
}

impl ManagedApp for FailureInformer {
    fn validate_spec(&self) -> Result<()> {
        self.spec
            .validate()
            .map_err(|e| spec_error("FailureInformer", &self.name_any(), &e))
    }

    fn credential_annotations(&self) -> BTreeMap<String, String> {
        FailureInformer::fixed_annotations()
    }

    fn workload_template(&self) -> Option<WorkloadTemplate> {
        Some(WorkloadTemplate {
            image: self.spec.image.clone(),
            command: self.effective_command(),
            replicas: self.spec.replicas.unwrap_or(DEFAULT_REPLICAS),
        })
    }
}

impl ManagedApp for AppScaler {
    fn validate_spec(&self) -> Result<()> {
        self.spec
            .validate()
            .map_err(|e| spec_error("AppScaler", &self.name_any(), &e))
    }

    fn credential_annotations(&self) -> BTreeMap<String, String> {
        AppScaler::fixed_annotations()
    }

    fn workload_template(&self) -> Option<WorkloadTemplate> {
        Some(WorkloadTemplate {
            image: self.spec.image.clone(),
            command: self.spec.command.clone(),
            replicas: self.spec.replicas.unwrap_or(DEFAULT_REPLICAS),
        })
    }
}

/// Provisioning state of an owner, inferred from its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    /// No credential yet
    Unprovisioned,
    /// Credential present, workload missing
    CredentialProvisioned,
    /// Workload present but not ready
    WorkloadProvisioned,
    /// Every child present and ready
    Settled,
}

impl std::fmt::Display for OwnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerState::Unprovisioned => write!(f, "Unprovisioned"),
            OwnerState::CredentialProvisioned => write!(f, "CredentialProvisioned"),
            OwnerState::WorkloadProvisioned => write!(f, "WorkloadProvisioned"),
            OwnerState::Settled => write!(f, "Settled"),
        }
    }
}

/// Infer an owner's state from what exists
pub fn infer_state(
    credential_present: bool,
    workload: Option<&ReplicaSet>,
    template: Option<&WorkloadTemplate>,
) -> OwnerState {
    if !credential_present {
        return OwnerState::Unprovisioned;
    }
    let Some(template) = template else {
        return OwnerState::Settled;
    };
    match workload {
        None => OwnerState::CredentialProvisioned,
        Some(rs) if is_ready(rs, template.replicas) => OwnerState::Settled,
        Some(_) => OwnerState::WorkloadProvisioned,
    }
}

/// Read the children of `app` and infer its state
pub async fn observe_state<A: ManagedApp>(
    secrets: &dyn ObjectStore<Secret>,
    replica_sets: &dyn ObjectStore<ReplicaSet>,
    app: &A,
) -> Result<OwnerState> {
    let identity = app.identity()?;
    let template = app.workload_template();
    let credential = secrets.get(&identity.namespace, &identity.name).await?;
    if let Some(ref live) = credential {
        verify_ownership(live, "secret", &identity)?;
    }
    let workload = match template {
        Some(_) => replica_sets.get(&identity.namespace, &identity.name).await?,
        None => None,
    };
    Ok(infer_state(
        credential.is_some(),
        workload.as_ref(),
        template.as_ref(),
    ))
}

/// Result of [`ensure_credential`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// This call created the credential
    Created,
    /// The credential was already there and was left untouched
    Existing,
}

async fn create_credential(
    secrets: &dyn ObjectStore<Secret>,
    identity: &OwnerIdentity,
    annotations: &BTreeMap<String, String>,
) -> Result<CredentialOutcome> {
    let secret = ResourceBuilder::new(identity).build_credential(annotations);
    match secrets.create(&secret).await {
        Ok(_) => {
            info!(
                kind = %identity.kind,
                name = %identity.name,
                namespace = %identity.namespace,
                "Created credential secret"
            );
            Ok(CredentialOutcome::Created)
        }
        Err(e) if e.is_already_exists() => {
            debug!(name = %identity.name, "Credential secret created concurrently");
            Ok(CredentialOutcome::Existing)
        }
        Err(e) => Err(e),
    }
}

/// Get-or-create the credential Secret of `app`.
///
/// An existing Secret is never rewritten, and losing a create race counts
/// as success.
pub async fn ensure_credential<A: ManagedApp>(
    secrets: &dyn ObjectStore<Secret>,
    app: &A,
) -> Result<CredentialOutcome> {
    let identity = app.identity()?;
    if let Some(live) = secrets.get(&identity.namespace, &identity.name).await? {
        verify_ownership(&live, "secret", &identity)?;
        return Ok(CredentialOutcome::Existing);
    }
    create_credential(secrets, &identity, &app.credential_annotations()).await
}

/// Result of [`ensure_replica_set`], carrying the live object
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadOutcome {
    /// The replica set did not exist and was created
    Created(ReplicaSet),
    /// The live spec had drifted and was replaced
    Updated(ReplicaSet),
    /// The live spec already matched
    Unchanged(ReplicaSet),
}

impl WorkloadOutcome {
    /// The replica set as it now stands
    pub fn live(&self) -> &ReplicaSet {
        match self {
            WorkloadOutcome::Created(rs)
            | WorkloadOutcome::Updated(rs)
            | WorkloadOutcome::Unchanged(rs) => rs,
        }
    }

    /// Whether this pass wrote anything
    pub fn changed(&self) -> bool {
        !matches!(self, WorkloadOutcome::Unchanged(_))
    }
}

/// Refuse to touch a child controlled by some other object
fn verify_ownership<K: Resource>(live: &K, child: &str, identity: &OwnerIdentity) -> Result<()> {
    let foreign = live
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != identity.owner_reference.uid);
    match foreign {
        Some(owner) => Err(OperatorError::InvalidConfig(format!(
            "{} '{}' is controlled by {} '{}', not {} '{}'",
            child, identity.name, owner.kind, owner.name, identity.kind, identity.name
        ))),
        None => Ok(()),
    }
}

/// Whether `live` already names this owner as its controller
fn is_controlled_by<K: Resource>(live: &K, identity: &OwnerIdentity) -> bool {
    live.owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == identity.owner_reference.uid)
}

async fn converge_workload(
    replica_sets: &dyn ObjectStore<ReplicaSet>,
    identity: &OwnerIdentity,
    template: &WorkloadTemplate,
    annotations: &BTreeMap<String, String>,
    live: Option<ReplicaSet>,
) -> Result<WorkloadOutcome> {
    let desired = ResourceBuilder::new(identity).build_replica_set(template, annotations);

    let Some(live) = live else {
        return match replica_sets.create(&desired).await {
            Ok(created) => {
                info!(
                    kind = %identity.kind,
                    name = %identity.name,
                    namespace = %identity.namespace,
                    replicas = template.replicas,
                    image = %template.image,
                    "Created replica set"
                );
                Ok(WorkloadOutcome::Created(created))
            }
            // Someone else created it between our read and write; reread.
            Err(e) if e.is_already_exists() => Err(OperatorError::Conflict {
                kind: "ReplicaSet".to_string(),
                name: identity.name.clone(),
                message: "created concurrently".to_string(),
            }),
            Err(e) => Err(e),
        };
    };

    verify_ownership(&live, "replica set", identity)?;

    let adopt = !is_controlled_by(&live, identity);
    if !adopt && !has_drifted(&desired, &live) {
        return Ok(WorkloadOutcome::Unchanged(live));
    }

    let mut updated = live;
    if adopt {
        // An orphan is adopted so garbage collection follows the owner.
        updated
            .owner_references_mut()
            .push(identity.owner_reference.clone());
    }
    updated.spec = desired.spec;
    let saved = replica_sets.replace(&updated).await?;
    info!(
        kind = %identity.kind,
        name = %identity.name,
        namespace = %identity.namespace,
        replicas = template.replicas,
        image = %template.image,
        "Updated replica set"
    );
    Ok(WorkloadOutcome::Updated(saved))
}

/// Get-or-create the replica set of `app` and fix any spec drift.
///
/// Returns `None` for kinds without a workload. A conflicting write is
/// returned as [`OperatorError::Conflict`] for the caller to requeue.
pub async fn ensure_replica_set<A: ManagedApp>(
    replica_sets: &dyn ObjectStore<ReplicaSet>,
    app: &A,
) -> Result<Option<WorkloadOutcome>> {
    let Some(template) = app.workload_template() else {
        return Ok(None);
    };
    let identity = app.identity()?;
    let live = replica_sets.get(&identity.namespace, &identity.name).await?;
    converge_workload(
        replica_sets,
        &identity,
        &template,
        &app.credential_annotations(),
        live,
    )
    .await
    .map(Some)
}

/// Outcome of one convergence pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convergence {
    /// State found at the start of the pass
    pub observed: OwnerState,
    /// State after the pass
    pub state: OwnerState,
    /// Whether the pass created or updated any child
    pub changed: bool,
}

impl Convergence {
    /// Whether nothing remains to be done
    pub fn is_settled(&self) -> bool {
        !self.changed && self.state == OwnerState::Settled
    }
}

/// Run one convergence pass for `app`: credential first, then workload
pub async fn converge<A: ManagedApp>(
    secrets: &dyn ObjectStore<Secret>,
    replica_sets: &dyn ObjectStore<ReplicaSet>,
    app: &A,
) -> Result<Convergence> {
    let identity = app.identity()?;
    let annotations = app.credential_annotations();
    let template = app.workload_template();

    let credential = secrets.get(&identity.namespace, &identity.name).await?;
    if let Some(ref live) = credential {
        verify_ownership(live, "secret", &identity)?;
    }
    let workload = match template {
        Some(_) => replica_sets.get(&identity.namespace, &identity.name).await?,
        None => None,
    };
    let observed = infer_state(credential.is_some(), workload.as_ref(), template.as_ref());

    let mut changed = false;
    if credential.is_none() {
        changed |= create_credential(secrets, &identity, &annotations).await?
            == CredentialOutcome::Created;
    }

    let state = match template {
        None => OwnerState::Settled,
        Some(template) => {
            let outcome =
                converge_workload(replica_sets, &identity, &template, &annotations, workload)
                    .await?;
            changed |= outcome.changed();
            infer_state(true, Some(outcome.live()), Some(&template))
        }
    };

    debug!(
        kind = %identity.kind,
        name = %identity.name,
        %observed,
        %state,
        changed,
        "Convergence pass finished"
    );

    Ok(Convergence {
        observed,
        state,
        changed,
    })
}
