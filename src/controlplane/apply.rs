//! Apply Protocols
//!
//! Typed create-or-update and create-only helpers on top of the untyped
//! [`ResourceClient`] port.

use crate::domain::ports::{CreateOutcome, ObjectKey, OperationResult, ResourceClient};
use crate::error::{Error, Result};
use kube::api::{ApiResource, DynamicObject};
use kube::core::TypeMeta;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Typed object that can travel through a [`ResourceClient`]
pub trait ManagedObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync
{
}

impl<K> ManagedObject for K where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync
{
}

/// API coordinates of a typed object
pub fn api_resource<K: ManagedObject>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Convert a typed object into its untyped form, stamping `apiVersion` and
/// `kind` from the type.
pub fn to_dynamic<K: ManagedObject>(object: &K) -> Result<DynamicObject> {
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(object)?)?;
    dynamic.types = Some(TypeMeta {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
    });
    Ok(dynamic)
}

/// Convert an untyped object back into `K`
pub fn from_dynamic<K: ManagedObject>(object: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Create or update `object` so that the stored state equals `mutate`
/// applied to it.
///
/// `object` only needs its name and namespace set on entry. When the object
/// exists, `mutate` runs against the fetched state, so its
/// `resourceVersion` guards the update; the update is skipped when `mutate`
/// leaves the fetched state unchanged. On return `object` holds the stored
/// state.
pub async fn create_or_update<K, F>(
    client: &dyn ResourceClient,
    object: &mut K,
    mutate: F,
) -> Result<OperationResult>
where
    K: ManagedObject,
    F: FnOnce(&mut K) -> Result<()> + Send,
{
    let resource = api_resource::<K>();
    let key = ObjectKey::from_meta(object.meta());

    match client.get(&resource, &key).await? {
        None => {
            mutate(object)?;
            ensure_key_unchanged::<K>(&key, object)?;

            debug!(kind = %resource.kind, key = %key, "Creating object");
            let created = client.create(&resource, &to_dynamic(object)?).await?;
            *object = from_dynamic(&created)?;
            Ok(OperationResult::Created)
        }
        Some(existing) => {
            *object = from_dynamic(&existing)?;
            let before = serde_json::to_value(&*object)?;

            mutate(object)?;
            ensure_key_unchanged::<K>(&key, object)?;

            if serde_json::to_value(&*object)? == before {
                return Ok(OperationResult::Unchanged);
            }

            debug!(kind = %resource.kind, key = %key, "Updating object");
            let updated = client.update(&resource, &to_dynamic(object)?).await?;
            *object = from_dynamic(&updated)?;
            Ok(OperationResult::Updated)
        }
    }
}

/// Create `object` unless an object with its key already exists. Existing
/// objects are left untouched.
pub async fn create_if_absent<K: ManagedObject>(
    client: &dyn ResourceClient,
    object: &K,
) -> Result<CreateOutcome> {
    let resource = api_resource::<K>();

    match client.create(&resource, &to_dynamic(object)?).await {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(Error::ResourceExists { .. }) => Ok(CreateOutcome::AlreadyPresent),
        Err(e) => Err(e),
    }
}

fn ensure_key_unchanged<K: ManagedObject>(key: &ObjectKey, object: &K) -> Result<()> {
    if ObjectKey::from_meta(object.meta()) == *key {
        Ok(())
    } else {
        Err(Error::MutationChangedKey {
            kind: K::kind(&()).into_owned(),
            name: key.to_string(),
        })
    }
}
