//! In-Memory Resource Client
//!
//! An object store that behaves like the platform API for the verbs the
//! reconcile core uses: uid and `resourceVersion` assignment, optimistic
//! concurrency on update, and an owner-reference garbage collector. It backs
//! the unit tests and the `--standalone` mode.
//!
//! Writes issued through [`ResourceClient`] are recorded; the out-of-band
//! helpers (`seed`, `modify`, `touch`, `delete`) stand in for other actors
//! and are not.

use crate::controlplane::apply::{api_resource, from_dynamic, to_dynamic, ManagedObject};
use crate::domain::ports::{ObjectKey, ResourceClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::SubsecRound;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject};
use kube::core::TypeMeta;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// Records
// =============================================================================

/// Verbs of the [`ResourceClient`] port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Create,
    Update,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Get => write!(f, "get"),
            Verb::Create => write!(f, "create"),
            Verb::Update => write!(f, "update"),
        }
    }
}

/// A write that reached the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub verb: Verb,
    pub kind: String,
    pub key: ObjectKey,
}

#[derive(Debug)]
struct Fault {
    verb: Verb,
    kind: String,
    name: String,
    error: Error,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct StoreKey {
    api_version: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

impl StoreKey {
    fn new(resource: &ApiResource, key: &ObjectKey) -> Self {
        Self {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }

    fn object_key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<StoreKey, DynamicObject>,
    revision: u64,
    uids: u64,
    faults: Vec<Fault>,
    writes: Vec<WriteRecord>,
}

impl Store {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uids += 1;
        format!("00000000-0000-4000-8000-{:012x}", self.uids)
    }

    fn take_fault(&mut self, verb: Verb, kind: &str, name: &str) -> Result<()> {
        let position = self
            .faults
            .iter()
            .position(|f| f.verb == verb && f.kind == kind && f.name == name);

        match position {
            Some(index) => {
                let fault = self.faults.remove(index);
                debug!(verb = %fault.verb, kind = %fault.kind, name = %fault.name, "Injecting failure");
                Err(fault.error)
            }
            None => Ok(()),
        }
    }

    fn insert_new(&mut self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let key = object_key(object)?;
        let store_key = StoreKey::new(resource, &key);

        if self.objects.contains_key(&store_key) {
            return Err(Error::ResourceExists {
                kind: resource.kind.clone(),
                name: key.to_string(),
            });
        }

        let mut stored = object.clone();
        stored.types = Some(type_meta(resource));
        stored.metadata.uid = Some(self.next_uid());
        stored.metadata.resource_version = Some(self.next_revision());
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now().trunc_subsecs(0)));
        stored.metadata.generation = Some(1);

        self.objects.insert(store_key, stored.clone());
        Ok(stored)
    }

    fn replace(&mut self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let key = object_key(object)?;
        let store_key = StoreKey::new(resource, &key);

        let current = self
            .objects
            .get(&store_key)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: resource.kind.clone(),
                name: key.to_string(),
            })?;

        if let Some(version) = &object.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(version) {
                return Err(Error::Conflict {
                    kind: resource.kind.clone(),
                    name: key.to_string(),
                });
            }
        }

        let mut stored = object.clone();
        stored.types = Some(type_meta(resource));
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();

        let generation = current.metadata.generation.unwrap_or(1);
        stored.metadata.generation = if stored.data.get("spec") != current.data.get("spec") {
            Some(generation + 1)
        } else {
            Some(generation)
        };
        stored.metadata.resource_version = Some(self.next_revision());

        self.objects.insert(store_key, stored.clone());
        Ok(stored)
    }
}

fn type_meta(resource: &ApiResource) -> TypeMeta {
    TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    }
}

fn object_key(object: &DynamicObject) -> Result<ObjectKey> {
    let key = ObjectKey::from_meta(&object.metadata);
    if key.name.is_empty() {
        return Err(Error::Internal("object has no name".into()));
    }
    Ok(key)
}

// =============================================================================
// Memory Resource Client
// =============================================================================

/// In-process [`ResourceClient`] with platform-like semantics
#[derive(Default)]
pub struct MemoryResourceClient {
    store: Mutex<Store>,
}

impl MemoryResourceClient {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `verb` on `kind`/`name` fail with `error`
    pub fn fail_next(&self, verb: Verb, kind: &str, name: &str, error: Error) {
        self.store.lock().faults.push(Fault {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
            error,
        });
    }

    /// Writes issued through the port so far
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.store.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.store.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.store.lock().writes.clear();
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.store.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().objects.is_empty()
    }

    /// All stored objects, ordered by API version, kind, namespace and name
    pub fn objects(&self) -> Vec<DynamicObject> {
        self.store.lock().objects.values().cloned().collect()
    }

    /// Store an object on behalf of another actor
    pub fn seed<K: ManagedObject>(&self, object: &K) -> Result<K> {
        let stored = self
            .store
            .lock()
            .insert_new(&api_resource::<K>(), &to_dynamic(object)?)?;
        from_dynamic(&stored)
    }

    /// Typed read of a stored object
    pub fn get_typed<K: ManagedObject>(&self, key: &ObjectKey) -> Option<K> {
        let store_key = StoreKey::new(&api_resource::<K>(), key);
        let object = self.store.lock().objects.get(&store_key).cloned()?;
        from_dynamic(&object).ok()
    }

    /// Edit a stored object on behalf of another actor
    pub fn modify<K, F>(&self, key: &ObjectKey, edit: F) -> Result<K>
    where
        K: ManagedObject,
        F: FnOnce(&mut K),
    {
        let resource = api_resource::<K>();
        let mut store = self.store.lock();

        let current = store
            .objects
            .get(&StoreKey::new(&resource, key))
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: resource.kind.clone(),
                name: key.to_string(),
            })?;

        let mut object: K = from_dynamic(&current)?;
        edit(&mut object);
        let stored = store.replace(&resource, &to_dynamic(&object)?)?;
        from_dynamic(&stored)
    }

    /// Bump the `resourceVersion` of a stored object without changing it
    pub fn touch<K: ManagedObject>(&self, key: &ObjectKey) -> Result<()> {
        self.modify::<K, _>(key, |_| {}).map(|_| ())
    }

    /// Remove an object. Dependents are only removed by
    /// [`collect_garbage`](Self::collect_garbage).
    pub fn delete<K: ManagedObject>(&self, key: &ObjectKey) -> Result<()> {
        let resource = api_resource::<K>();
        match self.store.lock().objects.remove(&StoreKey::new(&resource, key)) {
            Some(_) => Ok(()),
            None => Err(Error::ResourceNotFound {
                kind: resource.kind.clone(),
                name: key.to_string(),
            }),
        }
    }

    /// Delete every object whose owners are all gone, transitively. Returns
    /// the number of objects removed.
    pub fn collect_garbage(&self) -> usize {
        let mut store = self.store.lock();
        let mut removed = 0;

        loop {
            let live: BTreeSet<String> = store
                .objects
                .values()
                .filter_map(|o| o.metadata.uid.clone())
                .collect();

            let orphans: Vec<StoreKey> = store
                .objects
                .iter()
                .filter(|(_, object)| match &object.metadata.owner_references {
                    Some(refs) if !refs.is_empty() => {
                        refs.iter().all(|r| !live.contains(&r.uid))
                    }
                    _ => false,
                })
                .map(|(key, _)| key.clone())
                .collect();

            if orphans.is_empty() {
                break;
            }

            for key in orphans {
                debug!(kind = %key.kind, key = %key.object_key(), "Garbage collecting orphan");
                store.objects.remove(&key);
                removed += 1;
            }
        }

        removed
    }
}

#[async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let mut store = self.store.lock();
        store.take_fault(Verb::Get, &resource.kind, &key.name)?;
        Ok(store.objects.get(&StoreKey::new(resource, key)).cloned())
    }

    async fn create(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let key = object_key(object)?;
        let mut store = self.store.lock();
        store.take_fault(Verb::Create, &resource.kind, &key.name)?;

        let stored = store.insert_new(resource, object)?;
        store.writes.push(WriteRecord {
            verb: Verb::Create,
            kind: resource.kind.clone(),
            key,
        });
        Ok(stored)
    }

    async fn update(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let key = object_key(object)?;
        let mut store = self.store.lock();
        store.take_fault(Verb::Update, &resource.kind, &key.name)?;

        let stored = store.replace(resource, object)?;
        store.writes.push(WriteRecord {
            verb: Verb::Update,
            kind: resource.kind.clone(),
            key,
        });
        Ok(stored)
    }
}
