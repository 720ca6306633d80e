//! Generic object store with optimistic concurrency and change notifications.
//!
//! Objects are keyed by namespace and name and carry [`ObjectMeta`]. Every
//! write bumps the store-wide resource version; an update carrying a stale
//! version is rejected with [`StoreError::Conflict`]. Deleting an object that
//! still has finalizers only marks it; it is removed once an update clears the
//! last finalizer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// Namespace and name of an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl ObjectKey {
    /// Build a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to the object that owns another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerReference {
    /// API group and version of the owner.
    pub api_version: String,
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner (same namespace).
    pub name: String,
    /// Uid of the owner.
    pub uid: String,
}

/// Metadata common to all stored objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Namespace.
    pub namespace: String,
    /// Name; may be left empty on create when `generate_name` is set.
    pub name: String,
    /// Prefix for a store-generated name.
    pub generate_name: Option<String>,
    /// Store-assigned unique id.
    pub uid: String,
    /// Incremented on every spec change.
    pub generation: u64,
    /// Store-wide write counter at the last write of this object.
    pub resource_version: u64,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Finalizers blocking removal.
    pub finalizers: Vec<String>,
    /// Set once deletion has been requested.
    pub deletion_requested: Option<DateTime<Utc>>,
    /// Creation time.
    pub created: Option<DateTime<Utc>>,
    /// Owners of this object.
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Metadata for a new object with a fixed name.
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Key of the object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Whether the finalizer is present.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add a finalizer; returns whether it was missing.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove a finalizer; returns whether it was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    /// Whether deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_requested.is_some()
    }
}

/// A storable object.
pub trait Object: Clone + fmt::Debug + Send + Sync + 'static {
    /// Kind name, used in errors and logs.
    const KIND: &'static str;

    /// Object metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Mutable object metadata.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Whether the desired state of both objects is the same; a difference
    /// bumps the generation on update.
    fn same_spec(&self, other: &Self) -> bool;
}

/// Change notification.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// The object was created.
    Created(T),
    /// The object was written.
    Updated {
        /// State before the write.
        old: T,
        /// State after the write.
        new: T,
    },
    /// The object was removed.
    Deleted(T),
}

/// Label equality selector; empty selects everything.
pub type LabelSelector = BTreeMap<String, String>;

/// Storage for one object kind.
#[async_trait]
pub trait ObjectStore<T: Object>: Send + Sync {
    /// Fetch an object; `None` if it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<T>, StoreError>;

    /// Objects in `namespace` (all namespaces if `None`) carrying all `labels`, in key order.
    async fn list(&self, namespace: Option<&str>, labels: &LabelSelector) -> Result<Vec<T>, StoreError>;

    /// Store a new object; returns it with store-assigned metadata.
    async fn create(&self, object: T) -> Result<T, StoreError>;

    /// Replace an object whose resource version matches the stored one.
    async fn update(&self, object: T) -> Result<T, StoreError>;

    /// Request deletion.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Stream of changes from now on.
    fn watch(&self) -> BoxStream<'static, WatchEvent<T>>;
}

/// In-process [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore<T: Object> {
    inner: Arc<RwLock<MemoryStoreInner<T>>>,
}

#[derive(Debug)]
struct MemoryStoreInner<T> {
    objects: HashMap<ObjectKey, T>,
    version: u64,
    watchers: Vec<mpsc::UnboundedSender<WatchEvent<T>>>,
}

impl<T: Object> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Object> MemoryStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryStoreInner {
                objects: HashMap::new(),
                version: 0,
                watchers: Vec::new(),
            })),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().objects.is_empty()
    }
}

impl<T: Object> MemoryStoreInner<T> {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn notify(&mut self, event: WatchEvent<T>) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn matches_labels(meta: &ObjectMeta, selector: &LabelSelector) -> bool {
    selector
        .iter()
        .all(|(k, v)| meta.labels.get(k).is_some_and(|value| value == v))
}

fn generated_name(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &suffix[..5])
}

#[async_trait]
impl<T: Object> ObjectStore<T> for MemoryStore<T> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<T>, StoreError> {
        Ok(self.inner.read().objects.get(key).cloned())
    }

    async fn list(&self, namespace: Option<&str>, labels: &LabelSelector) -> Result<Vec<T>, StoreError> {
        let inner = self.inner.read();
        let mut objects: Vec<T> = inner
            .objects
            .values()
            .filter(|o| namespace.map_or(true, |ns| o.meta().namespace == ns))
            .filter(|o| matches_labels(o.meta(), labels))
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.meta().key().cmp(&b.meta().key()));
        Ok(objects)
    }

    async fn create(&self, mut object: T) -> Result<T, StoreError> {
        let mut inner = self.inner.write();

        let meta = object.meta_mut();
        if meta.name.is_empty() {
            match meta.generate_name.as_deref() {
                Some(prefix) => meta.name = generated_name(prefix),
                None => return Err(StoreError::Backend(format!("{} without name", T::KIND))),
            }
        }
        let key = meta.key();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                key: key.to_string(),
            });
        }

        let version = inner.next_version();
        let meta = object.meta_mut();
        meta.uid = Uuid::new_v4().to_string();
        meta.generation = 1;
        meta.resource_version = version;
        meta.deletion_requested = None;
        meta.created = Some(Utc::now());

        debug!(kind = T::KIND, %key, version, "created");
        inner.objects.insert(key, object.clone());
        inner.notify(WatchEvent::Created(object.clone()));
        Ok(object)
    }

    async fn update(&self, mut object: T) -> Result<T, StoreError> {
        let mut inner = self.inner.write();
        let key = object.meta().key();

        let old = match inner.objects.get(&key) {
            Some(stored) => stored.clone(),
            None => {
                return Err(StoreError::NotFound {
                    kind: T::KIND,
                    key: key.to_string(),
                })
            }
        };
        if old.meta().resource_version != object.meta().resource_version {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key: key.to_string(),
                expected: object.meta().resource_version,
                actual: old.meta().resource_version,
            });
        }

        let version = inner.next_version();
        let bump = u64::from(!old.same_spec(&object));
        let meta = object.meta_mut();
        meta.uid = old.meta().uid.clone();
        meta.created = old.meta().created;
        meta.deletion_requested = old.meta().deletion_requested;
        meta.generation = old.meta().generation + bump;
        meta.resource_version = version;

        if object.meta().is_deleting() && object.meta().finalizers.is_empty() {
            debug!(kind = T::KIND, %key, "last finalizer removed; deleting");
            inner.objects.remove(&key);
            inner.notify(WatchEvent::Deleted(object.clone()));
        } else {
            debug!(kind = T::KIND, %key, version, "updated");
            inner.objects.insert(key, object.clone());
            inner.notify(WatchEvent::Updated {
                old,
                new: object.clone(),
            });
        }
        Ok(object)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.objects.get(key).cloned() else {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                key: key.to_string(),
            });
        };

        if stored.meta().finalizers.is_empty() {
            debug!(kind = T::KIND, %key, "deleted");
            inner.objects.remove(key);
            inner.notify(WatchEvent::Deleted(stored));
            return Ok(());
        }
        if stored.meta().is_deleting() {
            return Ok(());
        }

        let version = inner.next_version();
        let mut marked = stored.clone();
        let meta = marked.meta_mut();
        meta.deletion_requested = Some(Utc::now());
        meta.resource_version = version;

        debug!(kind = T::KIND, %key, finalizers = ?marked.meta().finalizers, "deletion requested");
        inner.objects.insert(key.clone(), marked.clone());
        inner.notify(WatchEvent::Updated {
            old: stored,
            new: marked,
        });
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().watchers.push(tx);
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed()
    }
}
