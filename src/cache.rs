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

//! The read-only object cache shared by informers and reconcilers.
//!
//! A [`Store`] holds the last state observed by an informer, indexed by
//! namespace and name. Reconcilers read from it and never write to it: writes
//! go to the cluster and come back through the watch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;

use crate::key::ObjectKey;

/// Equality-based label selector.
pub type LabelSelector = BTreeMap<String, String>;

/// Returns true if every selector label is present with the same value.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Anything that can report whether its initial listing has completed.
pub trait HasSynced: Send + Sync {
    /// Returns true once the cache reflects a complete listing.
    fn has_synced(&self) -> bool;
}

/// Indexed snapshot of objects of one kind.
pub struct Store<K> {
    objects: Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>,
    synced: Arc<AtomicBool>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            synced: Arc::clone(&self.synced),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            synced: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<K> Store<K>
where
    K: Resource + Clone,
{
    /// Creates an empty, unsynced store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached object with the given key.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Lists cached objects in `namespace` matching `selector`, ordered by
    /// key. An empty namespace lists every namespace.
    pub fn list(&self, namespace: &str, selector: &LabelSelector) -> Vec<Arc<K>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<(&ObjectKey, &Arc<K>)> = objects
            .iter()
            .filter(|(key, _)| namespace.is_empty() || key.namespace == namespace)
            .filter(|(_, obj)| selector_matches(selector, obj.labels()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(b.0));
        matched.into_iter().map(|(_, obj)| Arc::clone(obj)).collect()
    }

    /// Returns every cached object.
    pub fn state(&self) -> Vec<Arc<K>> {
        self.list("", &LabelSelector::new())
    }

    /// Returns the number of cached objects.
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces an object, returning the previous version.
    ///
    /// Objects without a name are ignored.
    pub fn apply(&self, obj: K) -> Option<Arc<K>> {
        let key = ObjectKey::from_object(&obj).ok()?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(obj))
    }

    /// Removes an object, returning the cached version.
    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Swaps in a complete listing, marks the store as synced and returns the
    /// previous content.
    pub fn replace(&self, objs: impl IntoIterator<Item = K>) -> HashMap<ObjectKey, Arc<K>> {
        let fresh: HashMap<ObjectKey, Arc<K>> = objs
            .into_iter()
            .filter_map(|obj| Some((ObjectKey::from_object(&obj).ok()?, Arc::new(obj))))
            .collect();
        let previous = {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *objects, fresh)
        };
        self.synced.store(true, Ordering::Release);
        previous
    }
}

impl<K> HasSynced for Store<K>
where
    K: Send + Sync,
{
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Waits until every cache has synced.
///
/// Returns false if `timeout` elapses or `cancel` fires first.
pub async fn wait_for_cache_sync(
    caches: &[&dyn HasSynced],
    timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    let poll = async {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            if caches.iter().all(|c| c.has_synced()) {
                return true;
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => false,
        res = tokio::time::timeout(timeout, poll) => res.unwrap_or(false),
    }
}
