//! Correlation markers on events
//!
//! A notifier claims an event by setting its claim label
//! (`<notifier>-notify: "true"`) and adding a non-controller owner reference
//! to itself. Claims of different notifiers live side by side on the same
//! event; releasing one never touches another notifier's label or any
//! third-party label.
//!
//! The pure functions here operate on copies of the event. The `*_persisted`
//! variants write the copy back with a conditional replace, so a concurrent
//! writer surfaces as [`OperatorError::Conflict`](crate::error::OperatorError).

use crate::crd::{is_valid_label_name, Notifier};
use crate::error::{OperatorError, Result};
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::debug;

/// Value of a claim label
pub const CLAIMED: &str = "true";

/// Claim-label key of a notifier, validated as a label key
pub fn claim_key(notifier: &Notifier) -> Result<String> {
    let key = notifier.claim_label_key();
    if !is_valid_label_name(&key) {
        return Err(OperatorError::ValidationError(format!(
            "claim label '{}' of notifier {} is not a valid label key",
            key,
            notifier.name_any()
        )));
    }
    Ok(key)
}

/// Non-controller owner reference pointing at a notifier
pub fn notifier_owner_reference(notifier: &Notifier) -> Result<OwnerReference> {
    notifier.owner_ref(&()).ok_or_else(|| {
        OperatorError::ValidationError(format!(
            "notifier {} has no uid yet",
            notifier.name_any()
        ))
    })
}

/// Whether the event carries the notifier's claim label
pub fn is_claimed_by(event: &Event, notifier: &Notifier) -> bool {
    event.labels().get(&notifier.claim_label_key()).map(String::as_str) == Some(CLAIMED)
}

fn has_owner(event: &Event, owner: &OwnerReference) -> bool {
    event
        .owner_references()
        .iter()
        .any(|r| r.uid == owner.uid)
}

/// Apply a claim to `event` in place. Returns whether anything changed.
fn apply_claim(event: &mut Event, notifier: &Notifier) -> Result<bool> {
    let key = claim_key(notifier)?;
    let owner = notifier_owner_reference(notifier)?;
    let mut changed = false;

    let labels = event.labels_mut();
    if labels.get(&key).map(String::as_str) != Some(CLAIMED) {
        labels.insert(key, CLAIMED.to_string());
        changed = true;
    }

    if !has_owner(event, &owner) {
        event.owner_references_mut().push(owner);
        changed = true;
    }

    Ok(changed)
}

/// Remove a claim from `event` in place. Returns whether anything changed.
fn apply_release(event: &mut Event, notifier: &Notifier) -> bool {
    let key = notifier.claim_label_key();
    let mut changed = event.labels_mut().remove(&key).is_some();

    let uid = notifier.uid();
    let name = notifier.name_any();
    let kind = Notifier::kind(&()).to_string();
    let refs = event.owner_references_mut();
    let before = refs.len();
    refs.retain(|r| match &uid {
        Some(uid) => &r.uid != uid,
        None => !(r.kind == kind && r.name == name),
    });
    changed |= refs.len() != before;

    changed
}

/// Copy of `event` claimed by `notifier`
pub fn claim(event: &Event, notifier: &Notifier) -> Result<Event> {
    let mut copy = event.clone();
    apply_claim(&mut copy, notifier)?;
    Ok(copy)
}

/// Copy of `event` with `notifier`'s claim removed
pub fn release(event: &Event, notifier: &Notifier) -> Event {
    let mut copy = event.clone();
    apply_release(&mut copy, notifier);
    copy
}

/// Copy of `event` with claims for every notifier in `claim_for` and no
/// claims left for any notifier in `release_for`, or `None` when the event
/// already looks like that.
pub fn reconcile_claims(
    event: &Event,
    claim_for: &[&Notifier],
    release_for: &[&Notifier],
) -> Result<Option<Event>> {
    let mut copy = event.clone();
    let mut changed = false;
    for notifier in claim_for {
        changed |= apply_claim(&mut copy, notifier)?;
    }
    for notifier in release_for {
        changed |= apply_release(&mut copy, notifier);
    }
    Ok(changed.then_some(copy))
}

/// Claim `event` for `notifier` and persist the copy
pub async fn claim_persisted(
    store: &dyn ObjectStore<Event>,
    event: &Event,
    notifier: &Notifier,
) -> Result<Event> {
    let claimed = claim(event, notifier)?;
    debug!(
        event = %event.name_any(),
        notifier = %notifier.name_any(),
        "Persisting claim"
    );
    store.replace(&claimed).await
}

/// Release `notifier`'s claim on `event` and persist the copy
pub async fn release_persisted(
    store: &dyn ObjectStore<Event>,
    event: &Event,
    notifier: &Notifier,
) -> Result<Event> {
    let released = release(event, notifier);
    debug!(
        event = %event.name_any(),
        notifier = %notifier.name_any(),
        "Persisting release"
    );
    store.replace(&released).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NotifierSpec;
    use crate::store::{Fault, MemoryStore};
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn notifier(name: &str) -> Notifier {
        Notifier {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("{}-uid", name)),
                ..Default::default()
            },
            spec: NotifierSpec {
                email: "ops@example.com".to_string(),
                filters: vec!["Fail.*".to_string()],
            },
            status: None,
        }
    }

    fn event() -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some("web-0.17a".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([("team".to_string(), "core".to_string())])),
                ..Default::default()
            },
            type_: Some("Warning".to_string()),
            reason: Some("FailedMount".to_string()),
            involved_object: ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some("web-0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_claim_sets_label_and_owner() {
        let n1 = notifier("n1");
        let original = event();
        let claimed = claim(&original, &n1).unwrap();

        assert!(is_claimed_by(&claimed, &n1));
        assert!(!is_claimed_by(&original, &n1));
        assert_eq!(claimed.labels().get("team"), Some(&"core".to_string()));

        let owners = claimed.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Notifier");
        assert_eq!(owners[0].uid, "n1-uid");
        assert_ne!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_claims_of_different_notifiers_coexist() {
        let (n1, n2) = (notifier("n1"), notifier("n2"));
        let both = claim(&claim(&event(), &n1).unwrap(), &n2).unwrap();
        assert!(is_claimed_by(&both, &n1));
        assert!(is_claimed_by(&both, &n2));
        assert_eq!(both.owner_references().len(), 2);

        let only_n2 = release(&both, &n1);
        assert!(!is_claimed_by(&only_n2, &n1));
        assert!(is_claimed_by(&only_n2, &n2));
        assert_eq!(only_n2.owner_references().len(), 1);
        assert_eq!(only_n2.labels().get("team"), Some(&"core".to_string()));
    }

    #[test]
    fn test_claim_is_idempotent() {
        let n1 = notifier("n1");
        let once = claim(&event(), &n1).unwrap();
        let twice = claim(&once, &n1).unwrap();
        assert_eq!(twice.owner_references().len(), 1);
        assert!(reconcile_claims(&once, &[&n1], &[]).unwrap().is_none());
    }

    #[test]
    fn test_claim_requires_uid() {
        let mut n1 = notifier("n1");
        n1.metadata.uid = None;
        assert!(matches!(
            claim(&event(), &n1),
            Err(OperatorError::ValidationError(_))
        ));
    }

    #[test]
    fn test_overlong_claim_key_is_rejected() {
        let long = notifier(&"n".repeat(60));
        assert!(claim_key(&long).is_err());
        assert!(claim(&event(), &long).is_err());
    }

    #[test]
    fn test_reconcile_claims_adds_and_removes() {
        let (n1, n2) = (notifier("n1"), notifier("n2"));
        let stale = claim(&event(), &n2).unwrap();
        let updated = reconcile_claims(&stale, &[&n1], &[&n2]).unwrap().unwrap();
        assert!(is_claimed_by(&updated, &n1));
        assert!(!is_claimed_by(&updated, &n2));
    }

    #[tokio::test]
    async fn test_persisted_claim_conflicts_on_stale_copy() {
        let store = MemoryStore::<Event>::new();
        let seeded = store.insert(event());
        let n1 = notifier("n1");

        store.modify("default", "web-0.17a", |e| e.message = Some("again".to_string()));
        let err = claim_persisted(&store, &seeded, &n1).await.unwrap_err();
        assert!(err.is_conflict());

        let fresh = store.snapshot("default", "web-0.17a").unwrap();
        let saved = claim_persisted(&store, &fresh, &n1).await.unwrap();
        assert!(is_claimed_by(&saved, &n1));
        assert_eq!(saved.message.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_persisted_release_surfaces_conflict() {
        let store = MemoryStore::<Event>::new();
        let n1 = notifier("n1");
        let seeded = store.insert(claim(&event(), &n1).unwrap());

        store.fail_next_replace(Fault::Conflict);
        assert!(release_persisted(&store, &seeded, &n1)
            .await
            .unwrap_err()
            .is_conflict());

        let saved = release_persisted(&store, &seeded, &n1).await.unwrap();
        assert!(!is_claimed_by(&saved, &n1));
    }
}
