// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process [`ObjectClient`] used by tests and local experiments.
//!
//! Mirrors the API server semantics the controllers rely on: generated names,
//! uids, monotonically increasing resource versions, conflicts on stale
//! writes and not-found errors. Every mutation is recorded so tests can assert
//! on the exact operations a reconciler issued.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::Store;
use crate::client::{ClientError, ObjectClient};
use crate::key::ObjectKey;

/// A mutation recorded by [`MemoryObjectClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// An object was created.
    Create(ObjectKey),
    /// An object was replaced.
    Update(ObjectKey),
    /// The status of an object was replaced.
    UpdateStatus(ObjectKey),
    /// An object was deleted.
    Delete(ObjectKey),
}

/// Client call that a [`Fault`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Verb {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// Failure injected into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The object does not exist.
    NotFound,
    /// The write raced with another one.
    Conflict,
    /// The store cannot be reached.
    Unavailable,
}

impl Fault {
    fn into_error(self) -> ClientError {
        match self {
            Fault::NotFound => ClientError::NotFound("injected".to_string()),
            Fault::Conflict => ClientError::Conflict("injected".to_string()),
            Fault::Unavailable => ClientError::Transient(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "store unavailable",
            ))),
        }
    }
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    next_version: u64,
    next_uid: u64,
    next_name: u64,
    operations: Vec<Operation>,
    faults: VecDeque<(Verb, Fault)>,
}

impl<K> State<K> {
    fn take_fault(&mut self, verb: Verb) -> Result<(), ClientError> {
        match self.faults.iter().position(|(v, _)| *v == verb) {
            Some(idx) => match self.faults.remove(idx) {
                Some((_, fault)) => Err(fault.into_error()),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory cluster state for one kind of object.
pub struct MemoryObjectClient<K> {
    state: Mutex<State<K>>,
}

impl<K> Default for MemoryObjectClient<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                next_version: 0,
                next_uid: 0,
                next_name: 0,
                operations: Vec::new(),
                faults: VecDeque::new(),
            }),
        }
    }
}

fn to_value<K: Serialize>(obj: &K) -> Result<Value, ClientError> {
    serde_json::to_value(obj).map_err(|err| ClientError::Invalid(err.to_string()))
}

fn from_value<K: DeserializeOwned>(value: Value) -> Result<K, ClientError> {
    serde_json::from_value(value).map_err(|err| ClientError::Invalid(err.to_string()))
}

/// Copies the `status` of `from` into `into`.
fn with_status_of<K>(into: &K, from: &K) -> Result<K, ClientError>
where
    K: Serialize + DeserializeOwned,
{
    let mut target = to_value(into)?;
    let status = to_value(from)?.get("status").cloned();
    if let Value::Object(map) = &mut target {
        match status {
            Some(status) => map.insert("status".to_string(), status),
            None => map.remove("status"),
        };
    }
    from_value(target)
}

impl<K> MemoryObjectClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    /// Creates an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores an object directly, without recording an operation.
    ///
    /// Missing uids and resource versions are filled in.
    pub fn insert(&self, mut obj: K) -> K {
        let mut state = self.lock();
        let Ok(key) = ObjectKey::from_object(&obj) else {
            return obj;
        };
        if obj.meta().uid.is_none() {
            state.next_uid += 1;
            obj.meta_mut().uid = Some(format!("uid-{}", state.next_uid));
        }
        obj.meta_mut().resource_version = Some(state.bump_version());
        state.objects.insert(key, obj.clone());
        obj
    }

    /// Returns the stored object, if any.
    pub fn object(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    /// Returns every stored object, ordered by key.
    pub fn objects(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    /// Marks an object as being deleted, the way a graceful deletion does.
    pub fn mark_deleting(&self, key: &ObjectKey, at: Time) {
        let mut state = self.lock();
        let version = state.bump_version();
        if let Some(obj) = state.objects.get_mut(key) {
            obj.meta_mut().deletion_timestamp = Some(at);
            obj.meta_mut().resource_version = Some(version);
        }
    }

    /// Returns the mutations issued so far.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Forgets the recorded mutations.
    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Makes the next call of the given kind fail.
    pub fn fail_next(&self, verb: Verb, fault: Fault) {
        self.lock().faults.push_back((verb, fault));
    }

    /// Replaces the content of `store` with the current objects, the way an
    /// informer does after a listing.
    pub fn sync_to(&self, store: &Store<K>) {
        store.replace(self.objects());
    }
}

#[async_trait]
impl<K> ObjectClient<K> for MemoryObjectClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, ClientError> {
        let mut state = self.lock();
        state.take_fault(Verb::Get)?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        let mut state = self.lock();
        state.take_fault(Verb::Create)?;

        let mut obj = obj.clone();
        if obj.meta().name.is_none() {
            let prefix = obj
                .meta()
                .generate_name
                .clone()
                .ok_or_else(|| ClientError::Invalid("name or generateName is required".into()))?;
            state.next_name += 1;
            obj.meta_mut().name = Some(format!("{prefix}{:05}", state.next_name));
        }
        obj.meta_mut().namespace = Some(namespace.to_string());

        let key = ObjectKey::from_object(&obj).map_err(|err| ClientError::Invalid(err.to_string()))?;
        if state.objects.contains_key(&key) {
            return Err(ClientError::Conflict(format!("{key} already exists")));
        }

        state.next_uid += 1;
        obj.meta_mut().uid = Some(format!("uid-{}", state.next_uid));
        obj.meta_mut().resource_version = Some(state.bump_version());
        state.objects.insert(key.clone(), obj.clone());
        state.operations.push(Operation::Create(key));
        Ok(obj)
    }

    async fn update(&self, obj: &K) -> Result<K, ClientError> {
        let mut state = self.lock();
        state.take_fault(Verb::Update)?;

        let key = ObjectKey::from_object(obj).map_err(|err| ClientError::Invalid(err.to_string()))?;
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        if obj.meta().resource_version.is_some()
            && obj.meta().resource_version != existing.meta().resource_version
        {
            return Err(ClientError::Conflict(format!("{key} has been modified")));
        }

        // the main resource ignores status changes
        let mut updated = with_status_of(obj, &existing)?;
        updated.meta_mut().uid = existing.meta().uid.clone();
        updated.meta_mut().resource_version = Some(state.bump_version());
        state.objects.insert(key.clone(), updated.clone());
        state.operations.push(Operation::Update(key));
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K, ClientError> {
        let mut state = self.lock();
        state.take_fault(Verb::UpdateStatus)?;

        let key = ObjectKey::from_object(obj).map_err(|err| ClientError::Invalid(err.to_string()))?;
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        if obj.meta().resource_version.is_some()
            && obj.meta().resource_version != existing.meta().resource_version
        {
            return Err(ClientError::Conflict(format!("{key} has been modified")));
        }

        let mut updated = with_status_of(&existing, obj)?;
        updated.meta_mut().resource_version = Some(state.bump_version());
        state.objects.insert(key.clone(), updated.clone());
        state.operations.push(Operation::UpdateStatus(key));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.take_fault(Verb::Delete)?;

        state
            .objects
            .remove(key)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        state.operations.push(Operation::Delete(key.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use kube::api::ObjectMeta;
    use kube::ResourceExt;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_generates_names() {
        let client = MemoryObjectClient::<Pod>::new();
        let template = Pod {
            metadata: ObjectMeta {
                generate_name: Some("web-".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let a = client.create("default", &template).await.unwrap();
        let b = client.create("default", &template).await.unwrap();
        assert_ne!(a.name_any(), b.name_any());
        assert!(a.name_any().starts_with("web-"));
        assert_eq!(a.namespace().as_deref(), Some("default"));
        assert!(a.uid().is_some());
        assert_eq!(client.objects().len(), 2);
    }

    #[tokio::test]
    async fn test_create_existing_conflicts() {
        let client = MemoryObjectClient::<Pod>::new();
        client.create("default", &pod("a")).await.unwrap();
        let err = client.create("default", &pod("a")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let client = MemoryObjectClient::<Pod>::new();
        let stored = client.insert(pod("a"));

        let fresh = client.update(&stored).await.unwrap();
        assert_ne!(fresh.resource_version(), stored.resource_version());

        let err = client.update(&stored).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_status_only_touches_status() {
        let client = MemoryObjectClient::<Pod>::new();
        let stored = client.insert(pod("a"));

        let mut changed = stored.clone();
        changed.metadata.labels = Some([("x".to_string(), "y".to_string())].into());
        changed.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });

        let updated = client.update_status(&changed).await.unwrap();
        assert!(updated.labels().is_empty());
        assert_eq!(
            updated.status.and_then(|s| s.phase).as_deref(),
            Some("Running")
        );
        assert_eq!(
            client.operations(),
            vec![Operation::UpdateStatus(ObjectKey::new("default", "a"))]
        );
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let client = MemoryObjectClient::<Pod>::new();
        let err = client
            .delete(&ObjectKey::new("default", "a"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once() {
        let client = MemoryObjectClient::<Pod>::new();
        client.insert(pod("a"));
        client.fail_next(Verb::Get, Fault::Unavailable);

        let key = ObjectKey::new("default", "a");
        assert!(matches!(
            client.get(&key).await,
            Err(ClientError::Transient(_))
        ));
        assert!(client.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_sync_to_store() {
        let client = MemoryObjectClient::<Pod>::new();
        client.insert(pod("a"));
        client.insert(pod("b"));

        let store = Store::new();
        client.sync_to(&store);
        assert_eq!(store.len(), 2);
    }
}
