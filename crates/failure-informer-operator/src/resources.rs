//! Kubernetes Resource Builders
//!
//! This module generates the child objects (credential Secret, ReplicaSet)
//! of an owner resource from its declared spec. Builders are pure and
//! deterministic: the same owner always yields the same objects.

use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

/// Value of `app.kubernetes.io/managed-by` on every child
pub const MANAGED_BY: &str = "failure-informer-operator";

/// Standard label naming the application kind
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard label naming the owning instance
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Standard label naming the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Identity of an owner resource, as seen by its children
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerIdentity {
    /// Owner kind (e.g. `AppScaler`)
    pub kind: String,
    /// Owner name; children reuse it
    pub name: String,
    /// Owner namespace; children live there too
    pub namespace: String,
    /// Controller reference placed on every child
    pub owner_reference: OwnerReference,
}

/// Declared workload of an owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadTemplate {
    /// Container image
    pub image: String,
    /// Container command (empty leaves the image entrypoint)
    pub command: Vec<String>,
    /// Desired replica count
    pub replicas: i32,
}

/// Builder for the child objects of one owner
pub struct ResourceBuilder<'a> {
    owner: &'a OwnerIdentity,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(owner: &'a OwnerIdentity) -> Self {
        Self { owner }
    }

    /// Labels identifying children of this owner; also the pod selector
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NAME.to_string(), self.owner.kind.to_lowercase());
        labels.insert(LABEL_INSTANCE.to_string(), self.owner.name.clone());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels
    }

    fn child_metadata(&self, annotations: &BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.owner.name.clone()),
            namespace: Some(self.owner.namespace.clone()),
            labels: Some(self.selector_labels()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations.clone())
            },
            owner_references: Some(vec![self.owner.owner_reference.clone()]),
            ..Default::default()
        }
    }

    /// Build the credential Secret.
    ///
    /// The Secret starts without data; whoever operates the mail backend
    /// fills it in, and the operator never rewrites it afterwards.
    pub fn build_credential(&self, annotations: &BTreeMap<String, String>) -> Secret {
        Secret {
            metadata: self.child_metadata(annotations),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Build the ReplicaSet running the owner's workload
    pub fn build_replica_set(
        &self,
        template: &WorkloadTemplate,
        annotations: &BTreeMap<String, String>,
    ) -> ReplicaSet {
        let selector_labels = self.selector_labels();

        let container = Container {
            name: self.owner.name.clone(),
            image: Some(template.image.clone()),
            command: if template.command.is_empty() {
                None
            } else {
                Some(template.command.clone())
            },
            ..Default::default()
        };

        ReplicaSet {
            metadata: self.child_metadata(annotations),
            spec: Some(ReplicaSetSpec {
                replicas: Some(template.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector_labels.clone()),
                    ..Default::default()
                },
                template: Some(PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector_labels),
                        annotations: if annotations.is_empty() {
                            None
                        } else {
                            Some(annotations.clone())
                        },
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// The fields of a ReplicaSet spec this operator owns.
///
/// Live objects come back from the API server with defaulted fields
/// (restart policy, termination message path, ...). Comparing only this
/// projection keeps defaulting from being mistaken for drift.
#[derive(Debug, PartialEq, Eq)]
pub struct WorkloadProjection {
    replicas: i32,
    selector: BTreeMap<String, String>,
    pod_labels: BTreeMap<String, String>,
    pod_annotations: BTreeMap<String, String>,
    containers: Vec<(String, Option<String>, Vec<String>)>,
}

impl WorkloadProjection {
    /// Project a ReplicaSet
    pub fn of(rs: &ReplicaSet) -> Self {
        let spec = rs.spec.clone().unwrap_or_default();
        let template = spec.template.unwrap_or_default();
        let pod_meta = template.metadata.unwrap_or_default();
        let containers = template
            .spec
            .map(|s| s.containers)
            .unwrap_or_default()
            .into_iter()
            .map(|c| (c.name, c.image, c.command.unwrap_or_default()))
            .collect();

        Self {
            replicas: spec.replicas.unwrap_or(1),
            selector: spec.selector.match_labels.unwrap_or_default(),
            pod_labels: pod_meta.labels.unwrap_or_default(),
            pod_annotations: pod_meta.annotations.unwrap_or_default(),
            containers,
        }
    }
}

/// Whether the live ReplicaSet differs from the desired one
pub fn has_drifted(desired: &ReplicaSet, live: &ReplicaSet) -> bool {
    WorkloadProjection::of(desired) != WorkloadProjection::of(live)
}

/// Whether the ReplicaSet's observed state has reached `desired` ready pods
pub fn is_ready(rs: &ReplicaSet, desired: i32) -> bool {
    match rs.status.as_ref() {
        Some(status) => {
            let observed_current = match (status.observed_generation, rs.metadata.generation) {
                (Some(observed), Some(generation)) => observed >= generation,
                _ => true,
            };
            observed_current
                && status.replicas == desired
                && status.ready_replicas.unwrap_or(0) >= desired
        }
        None => desired == 0,
    }
}
