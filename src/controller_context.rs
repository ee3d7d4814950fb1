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

//! Controller context - shared resources for all controllers.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use rand::Rng;
use serde::de::DeserializeOwned;

use crate::config::ControllerManagerConfig;
use crate::informer::{Informer, ResyncPeriodFn};
use crate::key::ObjectKey;
use crate::rate_limiter::default_controller_rate_limiter;
use crate::workqueue::WorkQueue;

/// Shared context for all controllers.
///
/// Holds the Kubernetes client and the configuration, and builds the
/// per-controller informers and queues from them.
#[derive(Clone)]
pub struct ControllerContext {
    /// Kubernetes client for making API requests.
    pub client: Client,

    /// Configuration for this controller manager instance.
    pub config: Arc<ControllerManagerConfig>,

    /// Function to generate resync periods.
    ///
    /// Randomized so informers do not all resync at the same moment.
    pub resync_period_fn: ResyncPeriodFn,
}

impl ControllerContext {
    /// Creates a new controller context.
    pub fn new(
        client: Client,
        config: Arc<ControllerManagerConfig>,
        resync_period_fn: ResyncPeriodFn,
    ) -> Self {
        Self {
            client,
            config,
            resync_period_fn,
        }
    }

    /// Returns a resync period for a controller.
    pub fn resync_period(&self) -> Duration {
        (self.resync_period_fn)()
    }

    /// Returns an API handle scoped to the configured namespace, or to all
    /// namespaces when none is configured.
    pub fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match self.config.generic.namespace.as_str() {
            "" => Api::all(self.client.clone()),
            ns => Api::namespaced(self.client.clone(), ns),
        }
    }

    /// Builds an informer for `K` with the configured resync period.
    pub fn informer<K>(&self, watcher_config: watcher::Config) -> Informer<K>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
        K::DynamicType: Default,
    {
        Informer::new(self.api::<K>())
            .with_watcher_config(watcher_config)
            .with_resync_period(Arc::clone(&self.resync_period_fn))
    }

    /// Builds a work queue using the configured rate limits.
    pub fn work_queue(&self, name: &str) -> WorkQueue<ObjectKey> {
        WorkQueue::new(name, default_controller_rate_limiter(&self.config.work_queue))
    }
}

/// Creates a resync period function with the given base duration.
///
/// The returned function adds 0 to 100% random jitter to `base`.
pub fn resync_period_fn(base: Duration) -> impl Fn() -> Duration + Send + Sync {
    move || {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_period_fn() {
        let base = Duration::from_secs(60);
        let fn_resync = resync_period_fn(base);

        let mut periods = std::collections::HashSet::new();
        for _ in 0..10 {
            let period = fn_resync();
            assert!(period >= base && period < base * 2);
            periods.insert(period);
        }

        // jittered
        assert!(periods.len() > 1);
    }
}
