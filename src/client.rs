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

//! Access to the cluster state store.
//!
//! Reconcilers read through the [`Store`](crate::cache::Store) cache and send
//! every mutation through an [`ObjectClient`]. The store is expected to provide
//! optimistic concurrency: a write based on a stale `resourceVersion` fails
//! with [`ClientError::Conflict`].

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::key::ObjectKey;

/// Errors returned by the cluster state store.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write was based on a stale version, or the object already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store rejected the object itself. Retrying cannot help.
    #[error("invalid object: {0}")]
    Invalid(String),

    /// The store could not be reached or failed internally.
    #[error("request failed: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ClientError {
    /// Returns true for [`ClientError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    /// Returns true for [`ClientError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => ClientError::NotFound(resp.message),
                409 => ClientError::Conflict(resp.message),
                400 | 422 => ClientError::Invalid(resp.message),
                _ => ClientError::Transient(Box::new(kube::Error::Api(resp))),
            },
            kube::Error::SerdeError(err) => ClientError::Invalid(err.to_string()),
            other => ClientError::Transient(Box::new(other)),
        }
    }
}

/// Read and write access to objects of one kind.
#[async_trait]
pub trait ObjectClient<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Reads the current version of an object, bypassing any cache.
    async fn get(&self, key: &ObjectKey) -> Result<K, ClientError>;

    /// Creates an object. `metadata.generateName` is honored.
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClientError>;

    /// Replaces an object. Fails with a conflict if `obj` is stale.
    async fn update(&self, obj: &K) -> Result<K, ClientError>;

    /// Replaces the status of an object. Fails with a conflict if `obj` is
    /// stale.
    async fn update_status(&self, obj: &K) -> Result<K, ClientError>;

    /// Deletes an object.
    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError>;
}

/// [`ObjectClient`] backed by the Kubernetes API server.
pub struct KubeObjectClient<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeObjectClient<K> {
    /// Creates a client for objects of kind `K`.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeObjectClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey, ClientError> {
    ObjectKey::from_object(obj).map_err(|err| ClientError::Invalid(err.to_string()))
}

#[async_trait]
impl<K> ObjectClient<K> for KubeObjectClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, ClientError> {
        Ok(self.api(&key.namespace).get(&key.name).await?)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn update(&self, obj: &K) -> Result<K, ClientError> {
        let key = key_of(obj)?;
        Ok(self
            .api(&key.namespace)
            .replace(&key.name, &PostParams::default(), obj)
            .await?)
    }

    async fn update_status(&self, obj: &K) -> Result<K, ClientError> {
        let key = key_of(obj)?;
        let value =
            serde_json::to_value(obj).map_err(|err| ClientError::Invalid(err.to_string()))?;
        // carrying the resource version makes the server reject stale writes
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        Ok(self
            .api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await?;
        Ok(())
    }
}
