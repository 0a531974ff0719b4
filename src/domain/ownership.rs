//! Ownership Wiring
//!
//! Stamps subordinate objects with a controller reference to the operator's
//! own Deployment so the platform garbage collector removes them together
//! with it.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

/// A validated parent object for cascading deletion
#[derive(Debug, Clone, PartialEq)]
pub struct Owner {
    reference: OwnerReference,
    namespace: Option<String>,
}

impl Owner {
    /// Build an owner handle from a live object.
    ///
    /// The object must carry a name and a uid (i.e. it was read back from the
    /// store) and must not be terminating.
    pub fn from_resource<K>(object: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()>,
    {
        let meta = object.meta();
        let name = meta.name.clone().unwrap_or_default();

        if meta.deletion_timestamp.is_some() {
            return Err(Error::OwnerInvalid(format!(
                "{}/{} is being deleted",
                K::kind(&()),
                name
            )));
        }

        let reference = object.controller_owner_ref(&()).ok_or_else(|| {
            Error::OwnerInvalid(format!("{}/{} has no name or uid", K::kind(&()), name))
        })?;

        Ok(Self {
            reference,
            namespace: meta.namespace.clone(),
        })
    }

    pub fn reference(&self) -> &OwnerReference {
        &self.reference
    }

    pub fn uid(&self) -> &str {
        &self.reference.uid
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.reference.kind, self.reference.name)
    }
}

/// Set `owner` as the controller of the object described by `child`.
///
/// A reference to the same owner (group, kind and name) is replaced in place,
/// including one left behind by an earlier incarnation with another uid.
/// Other non-controller references are kept.
pub fn set_controller_reference(owner: &Owner, child: &mut ObjectMeta) -> Result<()> {
    let child_name = child.name.clone().unwrap_or_default();

    if let Some(owner_ns) = owner.namespace() {
        match child.namespace.as_deref() {
            None => {
                return Err(Error::OwnerInvalid(format!(
                    "cluster-scoped object {} cannot be owned by namespaced {}",
                    child_name, owner
                )));
            }
            Some(child_ns) if child_ns != owner_ns => {
                return Err(Error::OwnerInvalid(format!(
                    "cross-namespace owner reference from {}/{} to {}",
                    child_ns, child_name, owner
                )));
            }
            Some(_) => {}
        }
    }

    let wanted = &owner.reference;
    let references = child.owner_references.get_or_insert_with(Vec::new);

    if let Some(existing) = references
        .iter()
        .find(|r| r.controller == Some(true) && !refers_to_same_object(r, wanted))
    {
        return Err(Error::AlreadyOwned {
            name: child_name,
            owner: format!("{}/{}", existing.kind, existing.name),
        });
    }

    match references.iter_mut().find(|r| refers_to_same_object(r, wanted)) {
        Some(existing) => *existing = wanted.clone(),
        None => references.push(wanted.clone()),
    }

    Ok(())
}

/// Owner references match on API group, kind and name; the version is
/// allowed to differ.
fn refers_to_same_object(a: &OwnerReference, b: &OwnerReference) -> bool {
    api_group(&a.api_version) == api_group(&b.api_version) && a.kind == b.kind && a.name == b.name
}

fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}
