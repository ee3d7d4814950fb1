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

//! Controllers run by the manager.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;

use crate::cache::{wait_for_cache_sync, HasSynced};
use crate::controller::{CancellationToken, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::controller_descriptor::ControllerRegistry;
use crate::informer::Informer;
use crate::key::ObjectKey;
use crate::reconciler::Reconciler;
use crate::worker::run_workers;
use crate::workqueue::WorkQueue;

pub mod routes;
pub mod scalepod;

/// Registers every built-in controller.
pub fn register_all(registry: &mut ControllerRegistry) -> Result<()> {
    registry.register(scalepod::descriptor())?;
    registry.register(routes::descriptor())?;
    Ok(())
}

/// The running informers of one controller.
pub(crate) struct InformerSet {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl InformerSet {
    /// Informers stop when `parent` is cancelled, or on [`InformerSet::stop`].
    pub(crate) fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    pub(crate) fn spawn<K>(&mut self, informer: Informer<K>)
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        self.tasks.spawn(informer.run(self.cancel.clone()));
    }

    pub(crate) async fn stop(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Waits for `caches`, then runs workers until `cancel` fires.
///
/// A cache that does not sync within the configured timeout fails the
/// controller. Cancellation before the sync is a clean stop.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn sync_and_run<R>(
    name: &'static str,
    ctx: &ControllerContext,
    cancel: CancellationToken,
    queue: WorkQueue<ObjectKey>,
    informers: InformerSet,
    caches: &[&dyn HasSynced],
    synced: &AtomicBool,
    reconciler: Arc<R>,
    workers: usize,
) -> Result<()>
where
    R: Reconciler,
{
    let generic = &ctx.config.generic;
    if !wait_for_cache_sync(caches, generic.cache_sync_timeout, &cancel).await {
        queue.shut_down();
        informers.stop().await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        tracing::error!(controller = name, timeout = ?generic.cache_sync_timeout, "caches did not sync");
        return Err(ControllerError::StartFailed {
            name: name.to_string(),
            source: "timed out waiting for caches to sync".into(),
        });
    }
    synced.store(true, Ordering::Release);
    tracing::info!(controller = name, "caches synced");

    run_workers(name, queue, reconciler, workers, generic.reconcile_timeout, cancel).await;

    synced.store(false, Ordering::Release);
    informers.stop().await;
    Ok(())
}
