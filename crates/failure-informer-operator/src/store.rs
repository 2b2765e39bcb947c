//! Object store abstraction over the Kubernetes API
//!
//! Every read and write the reconcilers perform goes through
//! [`ObjectStore`]. [`KubeStore`] is the production implementation backed by
//! `kube::Api`; [`MemoryStore`] keeps objects in memory with real
//! resource-version conflict detection and is used by the tests.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMatch {
    labels: BTreeMap<String, String>,
}

impl LabelMatch {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring `key=value`
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(key, value)
    }

    /// Add another `key=value` requirement
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether no requirement is set
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Check a label map against every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Render as a Kubernetes label selector string
    pub fn to_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// CRUD access to namespaced objects of one kind.
///
/// `get` reports absence as `Ok(None)`. `replace` is conditional on the
/// object's `metadata.resourceVersion`: a stale version fails with
/// [`OperatorError::Conflict`].
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync,
{
    /// Fetch one object
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects in a namespace matching a label selector
    async fn list(&self, namespace: &str, selector: &LabelMatch) -> Result<Vec<K>>;

    /// Create a new object
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an existing object, conditional on its resource version
    async fn replace(&self, obj: &K) -> Result<K>;
}

/// Shared handle to a store
pub type SharedStore<K> = Arc<dyn ObjectStore<K>>;

/// Namespace and name of an object, or a validation error
fn object_key<K: Resource<DynamicType = ()>>(obj: &K) -> Result<(String, String)> {
    let name = obj.meta().name.clone().ok_or_else(|| {
        OperatorError::ValidationError(format!("{} is missing metadata.name", K::kind(&())))
    })?;
    let namespace = obj.meta().namespace.clone().ok_or_else(|| {
        OperatorError::ValidationError(format!(
            "{} {} is missing metadata.namespace",
            K::kind(&()),
            name
        ))
    })?;
    Ok((namespace, name))
}

/// [`ObjectStore`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone())
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| OperatorError::from_kube(e, &K::kind(&()), namespace, name))
    }

    async fn list(&self, namespace: &str, selector: &LabelMatch) -> Result<Vec<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_selector());
        }
        let list = api
            .list(&lp)
            .await
            .map_err(|e| OperatorError::from_kube(e, &K::kind(&()), namespace, ""))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_key(obj)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        debug!(kind = %K::kind(&()), name = %name, namespace = %namespace, "Creating object");
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| OperatorError::from_kube(e, &K::kind(&()), &namespace, &name))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_key(obj)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        debug!(
            kind = %K::kind(&()),
            name = %name,
            namespace = %namespace,
            resource_version = ?obj.meta().resource_version,
            "Replacing object"
        );
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| OperatorError::from_kube(e, &K::kind(&()), &namespace, &name))
    }
}

/// Failure to inject into the next matching [`MemoryStore`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with an optimistic-concurrency conflict
    Conflict,
    /// Fail with a transient store error
    Transient,
    /// Fail with "already exists" (create only)
    AlreadyExists,
}

impl Fault {
    fn into_error(self, kind: &str, name: &str) -> OperatorError {
        match self {
            Fault::Conflict => OperatorError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: "injected conflict".to_string(),
            },
            Fault::Transient => OperatorError::Transient(format!("{}/{}: injected", kind, name)),
            Fault::AlreadyExists => OperatorError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
        }
    }
}

/// In-memory [`ObjectStore`] with resource-version conflict detection
pub struct MemoryStore<K> {
    objects: DashMap<(String, String), K>,
    version: AtomicU64,
    creates: AtomicU64,
    replaces: AtomicU64,
    create_faults: Mutex<VecDeque<Fault>>,
    replace_faults: Mutex<VecDeque<Fault>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
            version: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            replaces: AtomicU64::new(0),
            create_faults: Mutex::new(VecDeque::new()),
            replace_faults: Mutex::new(VecDeque::new()),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync,
{
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Seed an object directly, assigning a resource version and uid
    pub fn insert(&self, mut obj: K) -> K {
        let key = object_key(&obj).unwrap_or_default();
        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.clone());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", version));
        }
        self.objects.insert(key, obj.clone());
        obj
    }

    /// Current copy of an object
    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .get(&(namespace.to_string(), name.to_string()))
            .map(|o| o.clone())
    }

    /// Mutate an object in place as a concurrent writer would, bumping its
    /// resource version
    pub fn modify(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) -> bool {
        let version = self.next_version();
        match self
            .objects
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            Some(mut entry) => {
                f(entry.value_mut());
                entry.meta_mut().resource_version = Some(version);
                true
            }
            None => false,
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Successful creates so far
    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Successful replaces so far
    pub fn replace_count(&self) -> u64 {
        self.replaces.load(Ordering::SeqCst)
    }

    /// Fail the next `create` call with `fault`
    pub fn fail_next_create(&self, fault: Fault) {
        self.create_faults.lock().push_back(fault);
    }

    /// Fail the next `replace` call with `fault`
    pub fn fail_next_replace(&self, fault: Fault) {
        self.replace_faults.lock().push_back(fault);
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.snapshot(namespace, name))
    }

    async fn list(&self, namespace: &str, selector: &LabelMatch) -> Result<Vec<K>> {
        let mut items: Vec<K> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == namespace && selector.matches(entry.value().labels()))
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by_key(|o| o.name_any());
        Ok(items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = object_key(obj)?;
        if let Some(fault) = self.create_faults.lock().pop_front() {
            return Err(fault.into_error(&K::kind(&()), &key.1));
        }
        if self.objects.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind: K::kind(&()).to_string(),
                name: key.1,
            });
        }
        let created = self.insert(obj.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = object_key(obj)?;
        if let Some(fault) = self.replace_faults.lock().pop_front() {
            return Err(fault.into_error(&K::kind(&()), &key.1));
        }
        let version = self.next_version();
        let mut entry = self
            .objects
            .get_mut(&key)
            .ok_or_else(|| OperatorError::NotFound {
                kind: K::kind(&()).to_string(),
                name: key.1.clone(),
                namespace: key.0.clone(),
            })?;
        let current = entry.meta().resource_version.clone();
        if let Some(expected) = obj.meta().resource_version.as_ref() {
            if current.as_ref() != Some(expected) {
                return Err(OperatorError::Conflict {
                    kind: K::kind(&()).to_string(),
                    name: key.1,
                    message: format!(
                        "resource version {} is stale (current {})",
                        expected,
                        current.unwrap_or_default()
                    ),
                });
            }
        }
        let uid = entry.meta().uid.clone();
        let mut updated = obj.clone();
        updated.meta_mut().resource_version = Some(version);
        updated.meta_mut().uid = uid;
        *entry = updated.clone();
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}
