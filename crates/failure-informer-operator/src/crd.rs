//! Custom Resource Definitions for the Failure Informer operator
//!
//! Three namespaced kinds live in the `failure-informer.io` group:
//!
//! - `Notifier` correlates warning events to an email recipient through a
//!   list of regex filters.
//! - `FailureInformer` runs a replica set of a given image plus an email
//!   credential Secret.
//! - `AppScaler` runs a replica set of a given image and command plus a
//!   credential Secret.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group shared by every owner kind
pub const API_GROUP: &str = "failure-informer.io";

/// Suffix appended to a notifier name to form its claim-label key
pub const NOTIFY_LABEL_SUFFIX: &str = "-notify";

/// Maximum length of the name part of a label key
pub const MAX_LABEL_NAME_LEN: usize = 63;

/// Placeholder command used when a FailureInformer declares none
pub const PLACEHOLDER_COMMAND: [&str; 2] = ["sleep", "1"];

/// Annotation set stamped on every FailureInformer child
pub const FAILURE_INFORMER_APP: &str = "notifier";

/// Annotation set stamped on every AppScaler child
pub const APP_SCALER_APP: &str = "appscaler";

/// Regex for validating label key names (qualified-name part)
static LABEL_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").unwrap()
});

/// Validate that every filter compiles as a regular expression
fn validate_filters(filters: &[String]) -> Result<(), ValidationError> {
    for filter in filters {
        if let Err(e) = Regex::new(filter) {
            return Err(ValidationError::new("invalid_filter")
                .with_message(format!("filter '{}' is not a valid regex: {}", filter, e).into()));
        }
    }
    Ok(())
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("image_required")
            .with_message("image must not be empty".into()));
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate an optional replica count
fn validate_replicas(value: i32) -> Result<(), ValidationError> {
    if !(0..=1000).contains(&value) {
        return Err(ValidationError::new("invalid_replicas")
            .with_message("replicas must be between 0 and 1000".into()));
    }
    Ok(())
}

/// Check whether a string is usable as the name part of a label key
pub fn is_valid_label_name(value: &str) -> bool {
    value.len() <= MAX_LABEL_NAME_LEN && LABEL_NAME_REGEX.is_match(value)
}

/// Notifier custom resource definition
///
/// A notifier claims every warning-level pod event in its namespace whose
/// reason matches *all* of its filters, and reports claimed events to its
/// email recipient.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "failure-informer.io",
    version = "v1",
    kind = "Notifier",
    plural = "notifiers",
    shortname = "ntf",
    namespaced,
    status = "NotifierStatus",
    printcolumn = r#"{"name":"Email", "type":"string", "jsonPath":".spec.email"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NotifierSpec {
    /// Recipient of notifications
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,

    /// Regex filters applied to the event reason; every filter must match.
    /// An empty list matches nothing.
    #[serde(default)]
    #[validate(custom(function = "validate_filters"))]
    pub filters: Vec<String>,
}

/// Observed state of a Notifier (reserved, never written)
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct NotifierStatus {}

impl Notifier {
    /// Recipient address
    pub fn email(&self) -> &str {
        &self.spec.email
    }

    /// Ordered filter list
    pub fn filters(&self) -> &[String] {
        &self.spec.filters
    }

    /// Label key marking an event as claimed by this notifier.
    ///
    /// Derived from the notifier name; events are only ever correlated with
    /// notifiers of their own namespace, so the name is unique in scope.
    pub fn claim_label_key(&self) -> String {
        claim_label_key(&kube::ResourceExt::name_any(self))
    }
}

/// Claim-label key for a notifier name
pub fn claim_label_key(notifier_name: &str) -> String {
    format!("{}{}", notifier_name, NOTIFY_LABEL_SUFFIX)
}

/// FailureInformer custom resource definition
///
/// Declares a replica set of `image` (running `command`, or a sleep
/// placeholder) plus a credential Secret for sending mail to `email`.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "failure-informer.io",
    version = "v1",
    kind = "FailureInformer",
    plural = "failureinformers",
    shortname = "fi",
    namespaced,
    status = "FailureInformerStatus",
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FailureInformerSpec {
    /// Desired replica count (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_replicas"))]
    pub replicas: Option<i32>,

    /// Container image
    #[validate(custom(function = "validate_image"))]
    pub image: String,

    /// Recipient of failure reports
    #[serde(default)]
    pub email: String,

    /// Container command; empty runs the sleep placeholder
    #[serde(default)]
    pub command: Vec<String>,
}

/// Observed state of a FailureInformer (reserved, never written)
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct FailureInformerStatus {}

impl FailureInformer {
    /// Fixed annotation set for children of this kind
    pub fn fixed_annotations() -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), FAILURE_INFORMER_APP.to_string())])
    }

    /// Command run by the replica set pods
    pub fn effective_command(&self) -> Vec<String> {
        if self.spec.command.is_empty() {
            PLACEHOLDER_COMMAND.iter().map(|s| s.to_string()).collect()
        } else {
            self.spec.command.clone()
        }
    }
}

/// AppScaler custom resource definition
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "failure-informer.io",
    version = "v1beta1",
    kind = "AppScaler",
    plural = "appscalers",
    shortname = "as",
    namespaced,
    status = "AppScalerStatus",
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppScalerSpec {
    /// Desired replica count (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_replicas"))]
    pub replicas: Option<i32>,

    /// Container image
    #[validate(custom(function = "validate_image"))]
    pub image: String,

    /// Container command
    #[serde(default)]
    pub command: Vec<String>,
}

/// Observed state of an AppScaler (reserved, never written)
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct AppScalerStatus {}

impl AppScaler {
    /// Fixed annotation set for children of this kind
    pub fn fixed_annotations() -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), APP_SCALER_APP.to_string())])
    }
}

/// Flatten validator errors into one message
pub fn describe_validation_errors(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(msg) => format!("{}: {}", field, msg),
                None => format!("{}: {}", field, e.code),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn notifier(name: &str, filters: &[&str]) -> Notifier {
        Notifier {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: NotifierSpec {
                email: "ops@example.com".to_string(),
                filters: filters.iter().map(|f| f.to_string()).collect(),
            },
            status: None,
        }
    }

    #[test]
    fn test_claim_label_key() {
        assert_eq!(notifier("n1", &[]).claim_label_key(), "n1-notify");
        assert_ne!(
            notifier("n1", &[]).claim_label_key(),
            notifier("n2", &[]).claim_label_key()
        );
    }

    #[test]
    fn test_label_name_validation() {
        assert!(is_valid_label_name("n1-notify"));
        assert!(!is_valid_label_name("-bad"));
        assert!(!is_valid_label_name(&"a".repeat(64)));
    }

    #[test]
    fn test_notifier_validation() {
        assert!(notifier("n1", &["Fail.*", "Mount$"]).spec.validate().is_ok());

        let err = notifier("n1", &["Fail(("]).spec.validate().unwrap_err();
        assert!(describe_validation_errors(&err).contains("filters"));

        let mut bad_email = notifier("n1", &[]);
        bad_email.spec.email = "not-an-email".to_string();
        let err = bad_email.spec.validate().unwrap_err();
        assert!(describe_validation_errors(&err).contains("email"));
    }

    #[test]
    fn test_owner_spec_validation() {
        let spec = AppScalerSpec {
            replicas: Some(3),
            image: "nginx".to_string(),
            command: vec![],
        };
        assert!(spec.validate().is_ok());

        let spec = AppScalerSpec {
            replicas: Some(-1),
            image: String::new(),
            command: vec![],
        };
        let msg = describe_validation_errors(&spec.validate().unwrap_err());
        assert!(msg.contains("replicas"));
        assert!(msg.contains("image"));
    }

    #[test]
    fn test_replica_bounds() {
        assert!(validate_replicas(0).is_ok());
        assert!(validate_replicas(1000).is_ok());
        assert!(validate_replicas(-1).is_err());
        assert!(validate_replicas(1001).is_err());

        let unset = FailureInformerSpec {
            replicas: None,
            image: "busybox".to_string(),
            email: "ops@example.com".to_string(),
            command: vec![],
        };
        assert!(unset.validate().is_ok());
    }

    #[test]
    fn test_failure_informer_placeholder_command() {
        let fi = FailureInformer {
            metadata: ObjectMeta::default(),
            spec: FailureInformerSpec {
                replicas: None,
                image: "busybox".to_string(),
                email: "ops@example.com".to_string(),
                command: vec![],
            },
            status: None,
        };
        assert_eq!(fi.effective_command(), vec!["sleep", "1"]);
        assert_eq!(
            FailureInformer::fixed_annotations().get("app"),
            Some(&"notifier".to_string())
        );
    }

    #[test]
    fn test_spec_serde_defaults() {
        let spec: NotifierSpec = serde_json::from_str(r#"{"email":"a@b.io"}"#).unwrap();
        assert!(spec.filters.is_empty());

        let spec: AppScalerSpec = serde_json::from_str(r#"{"image":"nginx"}"#).unwrap();
        assert_eq!(spec.replicas, None);
    }
}
