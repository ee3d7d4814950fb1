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

//! Translates watch events into reconciliation keys.
//!
//! Handlers only enqueue: they never touch the cluster and never block. Events
//! whose object cannot be keyed are logged and dropped, since a malformed
//! identity does not fix itself on retry.

use kube::{Resource, ResourceExt};

use crate::informer::WatchEvent;
use crate::key::ObjectKey;
use crate::workqueue::WorkQueue;

/// Returns the key of the object's controlling owner, if that owner is of
/// kind `owner_kind`. The owner lives in the object's namespace.
pub fn controller_owner_key<K: Resource>(obj: &K, owner_kind: &str) -> Option<ObjectKey> {
    let owner = obj
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == owner_kind)?;
    Some(ObjectKey::new(
        obj.namespace().unwrap_or_default(),
        owner.name.clone(),
    ))
}

/// Handler that enqueues the key of the object itself, for every event class.
pub fn enqueue_object<K>(queue: WorkQueue<ObjectKey>) -> impl Fn(&WatchEvent<K>) + Send + Sync
where
    K: Resource,
{
    move |event: &WatchEvent<K>| match ObjectKey::from_object(event.object().as_ref()) {
        Ok(key) => {
            tracing::debug!(queue = queue.name(), %key, event = event.class(), "enqueue");
            queue.add(key);
        }
        Err(err) => {
            tracing::warn!(queue = queue.name(), error = %err, event = event.class(), "dropping event");
        }
    }
}

/// Handler that enqueues the key of the object's controlling owner.
///
/// Objects without a controller reference of kind `owner_kind` are ignored.
pub fn enqueue_controller_owner<K>(
    queue: WorkQueue<ObjectKey>,
    owner_kind: &'static str,
) -> impl Fn(&WatchEvent<K>) + Send + Sync
where
    K: Resource,
{
    move |event: &WatchEvent<K>| {
        let obj = event.object().as_ref();
        if let Some(key) = controller_owner_key(obj, owner_kind) {
            if key.name.is_empty() {
                tracing::warn!(
                    queue = queue.name(),
                    object = %obj.name_any(),
                    "dropping event with unnamed owner reference"
                );
                return;
            }
            tracing::debug!(
                queue = queue.name(),
                %key,
                object = %obj.name_any(),
                event = event.class(),
                "enqueue owner"
            );
            queue.add(key);
        }
    }
}

/// Like [`enqueue_controller_owner`], but only for `Deleted` events.
pub fn enqueue_controller_owner_on_delete<K>(
    queue: WorkQueue<ObjectKey>,
    owner_kind: &'static str,
) -> impl Fn(&WatchEvent<K>) + Send + Sync
where
    K: Resource,
{
    let inner = enqueue_controller_owner(queue, owner_kind);
    move |event: &WatchEvent<K>| {
        if matches!(event, WatchEvent::Deleted(_)) {
            inner(event);
        }
    }
}
