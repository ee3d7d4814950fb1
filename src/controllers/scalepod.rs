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

//! The ScalePod controller.
//!
//! Keeps `spec.replicas` pods running for every ScalePod and reports the
//! available pods in its status. Each pass measures the pods through the
//! cache, records what it saw, then issues one batch of creations or
//! deletions and asks to be requeued so the next pass measures the result.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};

use super::{sync_and_run, InformerSet};
use crate::cache::{LabelSelector, Store};
use crate::client::{ClientError, KubeObjectClient, ObjectClient};
use crate::config::ScalePodControllerConfig;
use crate::controller::{CancellationToken, Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::controller_descriptor::{constructor, ControllerDescriptor};
use crate::crd::{ScalePod, ScalePodCondition, ScalePodStatus, APP_LABEL};
use crate::event_handler::{controller_owner_key, enqueue_controller_owner, enqueue_object};
use crate::key::ObjectKey;
use crate::reconciler::{Action, ReconcileError, Reconciler};

/// Canonical name of the controller.
pub const CONTROLLER_NAME: &str = "scalepod";

const OWNER_KIND: &str = "ScalePod";

/// Type of the condition summarizing convergence.
pub const READY_CONDITION: &str = "Ready";

/// Ready reason after a pod could not be created.
pub const CREATE_FAILED: &str = "CreateFailed";

/// Ready reason after a surplus pod could not be deleted.
pub const DELETE_FAILED: &str = "DeleteFailed";

/// Ready reason when the owner cannot be referenced by its pods.
pub const INVALID_OWNER: &str = "InvalidOwner";

/// Converges the pods of one ScalePod per pass.
pub struct ScalePodReconciler {
    owners: Arc<dyn ObjectClient<ScalePod>>,
    pods: Arc<dyn ObjectClient<Pod>>,
    owner_cache: Store<ScalePod>,
    pod_cache: Store<Pod>,
    config: ScalePodControllerConfig,
}

impl ScalePodReconciler {
    /// Creates a reconciler writing through the given clients and reading
    /// through the given caches.
    pub fn new(
        owners: Arc<dyn ObjectClient<ScalePod>>,
        pods: Arc<dyn ObjectClient<Pod>>,
        owner_cache: Store<ScalePod>,
        pod_cache: Store<Pod>,
        config: ScalePodControllerConfig,
    ) -> Self {
        Self {
            owners,
            pods,
            owner_cache,
            pod_cache,
            config,
        }
    }

    /// Cleans up after an owner that no longer exists.
    async fn delete_orphans(&self, key: &ObjectKey) -> std::result::Result<Action, ReconcileError> {
        if self.config.cascade_deletion_by_store {
            tracing::debug!("owner deleted, pods are collected by the store");
            return Ok(Action::Done);
        }

        let selector: LabelSelector = [(APP_LABEL.to_string(), key.name.clone())].into();
        let orphans: Vec<_> = self
            .pod_cache
            .list(&key.namespace, &selector)
            .into_iter()
            .filter(|pod| pod.meta().deletion_timestamp.is_none())
            .filter(|pod| controller_owner_key(pod.as_ref(), OWNER_KIND).as_ref() == Some(key))
            .collect();

        tracing::info!(count = orphans.len(), "owner deleted, deleting its pods");
        for pod in &orphans {
            self.delete_pod(pod).await?;
        }
        Ok(Action::Done)
    }

    async fn delete_pod(&self, pod: &Pod) -> std::result::Result<(), ReconcileError> {
        let key = ObjectKey::from_object(pod)?;
        match self.pods.delete(&key).await {
            Ok(()) => {
                tracing::info!(pod = %key.name, "deleted pod");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(batch_failure(err)),
        }
    }

    /// Marks the owner not ready with the error that blocked the pass, and
    /// hands the error back. The status write is best effort.
    async fn report_failure(
        &self,
        mut owner: ScalePod,
        reason: &str,
        err: ReconcileError,
    ) -> ReconcileError {
        let status = owner.status.get_or_insert_with(ScalePodStatus::default);
        status.conditions = vec![ScalePodCondition {
            type_: READY_CONDITION.to_string(),
            status: "False".to_string(),
            reason: reason.to_string(),
            message: err.to_string(),
        }];
        match self.owners.update_status(&owner).await {
            Ok(_) => tracing::debug!(reason, "recorded failure in status"),
            Err(status_err) => tracing::debug!(error = %status_err, "failed to record failure in status"),
        }
        err
    }

    fn new_pod(&self, owner: &ScalePod, owner_ref: OwnerReference) -> Pod {
        Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-pod", owner.name_any())),
                namespace: owner.namespace(),
                labels: Some(owner.selector_labels()),
                owner_references: Some(vec![owner_ref]),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "busybox".to_string(),
                    image: Some(self.config.pod_image.clone()),
                    command: Some(self.config.pod_command.clone()),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }
}

/// A failed mutation inside a create or delete batch. The remaining batch is
/// abandoned and the pass retried.
fn batch_failure(err: ClientError) -> ReconcileError {
    ReconcileError::Transient(Box::new(err))
}

/// Returns true if `pod` counts towards the available replicas of `owner`.
fn is_available(pod: &Pod, owner: &ScalePod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if !matches!(phase, None | Some("Running") | Some("Pending")) {
        return false;
    }

    match pod.owner_references().iter().find(|r| r.controller == Some(true)) {
        None => true,
        Some(r) => {
            r.kind == OWNER_KIND
                && match owner.uid() {
                    Some(uid) => r.uid == uid,
                    None => r.name == owner.name_any(),
                }
        }
    }
}

fn ready_condition(available: usize, desired: usize) -> ScalePodCondition {
    let (status, reason) = match available.cmp(&desired) {
        std::cmp::Ordering::Equal => ("True", "Converged"),
        std::cmp::Ordering::Less => ("False", "ScalingUp"),
        std::cmp::Ordering::Greater => ("False", "ScalingDown"),
    };
    ScalePodCondition {
        type_: READY_CONDITION.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: format!("{available} of {desired} pods available"),
    }
}

fn observed_status(available: &[Arc<Pod>], desired: usize) -> ScalePodStatus {
    ScalePodStatus {
        pod_names: available.iter().map(|pod| pod.name_any()).collect(),
        available_replicas: i32::try_from(available.len()).unwrap_or(i32::MAX),
        conditions: vec![ready_condition(available.len(), desired)],
    }
}

/// Returns true if `recorded` needs no rewrite to reflect `observed`.
///
/// A recorded failure stands until the available pods change or the owner
/// converges, so retries of a blocked pass do not rewrite the status.
fn status_is_current(recorded: Option<&ScalePodStatus>, observed: &ScalePodStatus) -> bool {
    let Some(recorded) = recorded else {
        return false;
    };
    if recorded == observed {
        return true;
    }
    let failed = recorded
        .conditions
        .iter()
        .any(|c| matches!(c.reason.as_str(), CREATE_FAILED | DELETE_FAILED | INVALID_OWNER));
    let converged = observed.conditions.iter().any(|c| c.status == "True");
    failed
        && !converged
        && recorded.pod_names == observed.pod_names
        && recorded.available_replicas == observed.available_replicas
}

#[async_trait]
impl Reconciler for ScalePodReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> std::result::Result<Action, ReconcileError> {
        let owner = match self.owner_cache.get(key) {
            Some(owner) => owner,
            // the cache may lag behind a fresh create, confirm before cleaning up
            None => match self.owners.get(key).await {
                Ok(owner) => Arc::new(owner),
                Err(err) if err.is_not_found() => return self.delete_orphans(key).await,
                Err(err) => return Err(err.into()),
            },
        };

        if owner.meta().deletion_timestamp.is_some() {
            tracing::debug!("owner is being deleted");
            return Ok(Action::Done);
        }

        let mut available: Vec<Arc<Pod>> = self
            .pod_cache
            .list(&key.namespace, &owner.selector_labels())
            .into_iter()
            .filter(|pod| is_available(pod, &owner))
            .collect();
        available.sort_by_key(|pod| pod.name_any());

        let desired = owner.desired_replicas();
        let status = observed_status(&available, desired);
        let mut current = (*owner).clone();
        if !status_is_current(current.status.as_ref(), &status) {
            current.status = Some(status);
            match self.owners.update_status(&current).await {
                Ok(written) => {
                    tracing::debug!(available = available.len(), desired, "updated status");
                    current = written;
                }
                Err(err) if err.is_not_found() => return Ok(Action::Done),
                Err(err) => return Err(err.into()),
            }
        }

        if available.len() > desired {
            // never delete on the word of a stale cache
            let fresh = match self.owners.get(key).await {
                Ok(fresh) => fresh,
                Err(err) if err.is_not_found() => return Ok(Action::Done),
                Err(err) => return Err(err.into()),
            };
            if fresh.uid() != owner.uid() || fresh.spec.replicas != owner.spec.replicas {
                tracing::debug!("owner changed since it was cached");
                return Ok(Action::Requeue);
            }

            let victims = &available[desired..];
            tracing::info!(available = available.len(), desired, count = victims.len(), "scaling down");
            for pod in victims {
                if let Err(err) = self.delete_pod(pod).await {
                    return Err(self.report_failure(current, DELETE_FAILED, err).await);
                }
            }
            return Ok(Action::Requeue);
        }

        if available.len() < desired {
            let Some(owner_ref) = owner.controller_owner_ref(&()) else {
                let err = ReconcileError::Invalid(format!("{key} has no uid"));
                return Err(self.report_failure(current, INVALID_OWNER, err).await);
            };
            let count = desired - available.len();
            tracing::info!(available = available.len(), desired, count, "scaling up");
            for _ in 0..count {
                let pod = self.new_pod(&owner, owner_ref.clone());
                match self.pods.create(&key.namespace, &pod).await {
                    Ok(created) => tracing::info!(pod = %created.name_any(), "created pod"),
                    Err(err) => {
                        let err = batch_failure(err);
                        return Err(self.report_failure(current, CREATE_FAILED, err).await);
                    }
                }
            }
            return Ok(Action::Requeue);
        }

        Ok(Action::Done)
    }
}

/// Runs the ScalePod informers and workers.
pub struct ScalePodController {
    workers: usize,
    synced: Arc<AtomicBool>,
}

impl ScalePodController {
    /// Creates a controller running `workers` concurrent workers.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            synced: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Controller for ScalePodController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        let queue = ctx.work_queue(CONTROLLER_NAME);

        let mut owners = ctx.informer::<ScalePod>(watcher::Config::default());
        owners.add_event_handler(enqueue_object(queue.clone()));
        let mut pods = ctx.informer::<Pod>(watcher::Config::default().labels(APP_LABEL));
        pods.add_event_handler(enqueue_controller_owner::<Pod>(queue.clone(), OWNER_KIND));

        let owner_cache = owners.store();
        let pod_cache = pods.store();
        let reconciler = Arc::new(ScalePodReconciler::new(
            Arc::new(KubeObjectClient::<ScalePod>::new(ctx.client.clone())),
            Arc::new(KubeObjectClient::<Pod>::new(ctx.client.clone())),
            owner_cache.clone(),
            pod_cache.clone(),
            ctx.config.scale_pod.clone(),
        ));

        let mut informers = InformerSet::new(&cancel);
        informers.spawn(owners);
        informers.spawn(pods);

        sync_and_run(
            CONTROLLER_NAME,
            &ctx,
            cancel,
            queue,
            informers,
            &[&owner_cache, &pod_cache],
            &self.synced,
            reconciler,
            self.workers,
        )
        .await
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let synced = self.synced.load(Ordering::Acquire);
        Box::pin(async move { synced })
    }

    fn worker_count(&self) -> usize {
        self.workers
    }
}

/// Descriptor registering the ScalePod controller.
pub fn descriptor() -> ControllerDescriptor {
    ControllerDescriptor::builder(CONTROLLER_NAME)
        .with_alias("scale-pod")
        .build(constructor(|ctx: ControllerContext, _cancel| async move {
            let workers = ctx.config.scale_pod.concurrent_scale_pod_syncs;
            if workers == 0 {
                return Err(ControllerError::InvalidConfig {
                    name: CONTROLLER_NAME.to_string(),
                    reason: "concurrentScalePodSyncs must be positive".to_string(),
                });
            }
            Ok(Some(Arc::new(ScalePodController::new(workers)) as Arc<dyn Controller>))
        }))
}
