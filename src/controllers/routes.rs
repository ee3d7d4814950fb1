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

//! The routes controller.
//!
//! Exposes every Deployment through a Service of the same name that selects
//! the deployment's pods, and removes the Service once the Deployment is gone.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::ObjectMeta;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};

use super::{sync_and_run, InformerSet};
use crate::cache::Store;
use crate::client::{KubeObjectClient, ObjectClient};
use crate::config::RoutesControllerConfig;
use crate::controller::{CancellationToken, Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::controller_descriptor::{constructor, ControllerDescriptor};
use crate::event_handler::{controller_owner_key, enqueue_controller_owner_on_delete, enqueue_object};
use crate::key::ObjectKey;
use crate::reconciler::{Action, ReconcileError, Reconciler};

/// Canonical name of the controller.
pub const CONTROLLER_NAME: &str = "routes";

const OWNER_KIND: &str = "Deployment";

/// Keeps one Service per Deployment.
pub struct RoutesReconciler {
    deployments: Arc<dyn ObjectClient<Deployment>>,
    services: Arc<dyn ObjectClient<Service>>,
    deployment_cache: Store<Deployment>,
    service_cache: Store<Service>,
    config: RoutesControllerConfig,
}

impl RoutesReconciler {
    /// Creates a reconciler writing through the given clients and reading
    /// through the given caches.
    pub fn new(
        deployments: Arc<dyn ObjectClient<Deployment>>,
        services: Arc<dyn ObjectClient<Service>>,
        deployment_cache: Store<Deployment>,
        service_cache: Store<Service>,
        config: RoutesControllerConfig,
    ) -> Self {
        Self {
            deployments,
            services,
            deployment_cache,
            service_cache,
            config,
        }
    }

    fn desired_spec(&self, deployment: &Deployment) -> std::result::Result<ServiceSpec, ReconcileError> {
        let selector = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|meta| meta.labels.clone())
            .filter(|labels| !labels.is_empty())
            .ok_or_else(|| {
                ReconcileError::Invalid(format!(
                    "deployment {} has no pod template labels",
                    deployment.name_any()
                ))
            })?;

        Ok(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(self.config.service_port_name.clone()),
                port: self.config.service_port,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        })
    }

    async fn delete_service(&self, key: &ObjectKey) -> std::result::Result<Action, ReconcileError> {
        // the cache may lag, ownership is confirmed against the store
        let existing = match self.services.get(key).await {
            Ok(service) => service,
            Err(err) if err.is_not_found() => return Ok(Action::Done),
            Err(err) => return Err(err.into()),
        };
        if controller_owner_key(&existing, OWNER_KIND).as_ref() != Some(key) {
            tracing::debug!("deployment deleted, service is not ours");
            return Ok(Action::Done);
        }

        match self.services.delete(key).await {
            Ok(()) => tracing::info!("deployment deleted, deleted service"),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Action::Done)
    }
}

/// Ports compared by name and number only, the API server defaults the rest.
fn ports_match(current: Option<&Vec<ServicePort>>, desired: Option<&Vec<ServicePort>>) -> bool {
    let summary = |ports: Option<&Vec<ServicePort>>| -> Vec<(Option<String>, i32)> {
        ports
            .map(|ports| ports.iter().map(|p| (p.name.clone(), p.port)).collect())
            .unwrap_or_default()
    };
    summary(current) == summary(desired)
}

fn is_controlled_by(service: &Service, deployment: &Deployment) -> bool {
    service
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.kind == OWNER_KIND && Some(&r.uid) == deployment.uid().as_ref())
}

#[async_trait]
impl Reconciler for RoutesReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> std::result::Result<Action, ReconcileError> {
        let deployment = match self.deployment_cache.get(key) {
            Some(deployment) => deployment,
            None => match self.deployments.get(key).await {
                Ok(deployment) => Arc::new(deployment),
                Err(err) if err.is_not_found() => return self.delete_service(key).await,
                Err(err) => return Err(err.into()),
            },
        };
        if deployment.meta().deletion_timestamp.is_some() {
            return Ok(Action::Done);
        }

        let desired = self.desired_spec(&deployment)?;

        let Some(existing) = self.service_cache.get(key) else {
            let owner_ref = deployment
                .controller_owner_ref(&())
                .ok_or_else(|| ReconcileError::Invalid(format!("{key} has no uid")))?;
            let service = Service {
                metadata: ObjectMeta {
                    name: Some(key.name.clone()),
                    namespace: Some(key.namespace.clone()),
                    labels: desired.selector.clone(),
                    owner_references: Some(vec![owner_ref]),
                    ..ObjectMeta::default()
                },
                spec: Some(desired),
                ..Service::default()
            };
            self.services.create(&key.namespace, &service).await?;
            tracing::info!("created service");
            return Ok(Action::Done);
        };

        if !is_controlled_by(&existing, &deployment) {
            tracing::warn!("service exists and is not managed by this deployment, leaving it alone");
            return Ok(Action::Done);
        }

        let current = existing.spec.clone().unwrap_or_default();
        if current.selector == desired.selector
            && ports_match(current.ports.as_ref(), desired.ports.as_ref())
        {
            return Ok(Action::Done);
        }

        let mut updated = (*existing).clone();
        let spec = updated.spec.get_or_insert_with(ServiceSpec::default);
        spec.selector = desired.selector;
        spec.ports = desired.ports;
        self.services.update(&updated).await?;
        tracing::info!("updated drifted service");
        Ok(Action::Done)
    }
}

/// Runs the Deployment and Service informers and the routes workers.
pub struct RoutesController {
    workers: usize,
    synced: Arc<AtomicBool>,
}

impl RoutesController {
    /// Creates a controller running `workers` concurrent workers.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            synced: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Controller for RoutesController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        let queue = ctx.work_queue(CONTROLLER_NAME);

        let mut deployments = ctx.informer::<Deployment>(watcher::Config::default());
        deployments.add_event_handler(enqueue_object(queue.clone()));
        let mut services = ctx.informer::<Service>(watcher::Config::default());
        services.add_event_handler(enqueue_controller_owner_on_delete::<Service>(
            queue.clone(),
            OWNER_KIND,
        ));

        let deployment_cache = deployments.store();
        let service_cache = services.store();
        let reconciler = Arc::new(RoutesReconciler::new(
            Arc::new(KubeObjectClient::<Deployment>::new(ctx.client.clone())),
            Arc::new(KubeObjectClient::<Service>::new(ctx.client.clone())),
            deployment_cache.clone(),
            service_cache.clone(),
            ctx.config.routes.clone(),
        ));

        let mut informers = InformerSet::new(&cancel);
        informers.spawn(deployments);
        informers.spawn(services);

        sync_and_run(
            CONTROLLER_NAME,
            &ctx,
            cancel,
            queue,
            informers,
            &[&deployment_cache, &service_cache],
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

/// Descriptor registering the routes controller.
pub fn descriptor() -> ControllerDescriptor {
    ControllerDescriptor::builder(CONTROLLER_NAME)
        .with_alias("deployment-service")
        .build(constructor(|ctx: ControllerContext, _cancel| async move {
            let workers = ctx.config.routes.concurrent_route_syncs;
            if workers == 0 {
                return Err(ControllerError::InvalidConfig {
                    name: CONTROLLER_NAME.to_string(),
                    reason: "concurrentRouteSyncs must be positive".to_string(),
                });
            }
            Ok(Some(Arc::new(RoutesController::new(workers)) as Arc<dyn Controller>))
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
    use pretty_assertions::assert_eq;

    use crate::memory::{MemoryObjectClient, Operation};

    struct Fixture {
        deployments: Arc<MemoryObjectClient<Deployment>>,
        services: Arc<MemoryObjectClient<Service>>,
        deployment_cache: Store<Deployment>,
        service_cache: Store<Service>,
        reconciler: RoutesReconciler,
    }

    fn fixture() -> Fixture {
        let deployments = Arc::new(MemoryObjectClient::new());
        let services = Arc::new(MemoryObjectClient::new());
        let deployment_cache = Store::new();
        let service_cache = Store::new();
        let reconciler = RoutesReconciler::new(
            deployments.clone(),
            services.clone(),
            deployment_cache.clone(),
            service_cache.clone(),
            RoutesControllerConfig::default(),
        );
        Fixture {
            deployments,
            services,
            deployment_cache,
            service_cache,
            reconciler,
        }
    }

    fn labels(app: &str) -> BTreeMap<String, String> {
        [("app".to_string(), app.to_string())].into()
    }

    impl Fixture {
        fn deployment(&self, name: &str, app: &str) -> Deployment {
            self.deployments.insert(Deployment {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some("default".to_string()),
                    ..ObjectMeta::default()
                },
                spec: Some(DeploymentSpec {
                    selector: LabelSelector {
                        match_labels: Some(labels(app)),
                        ..LabelSelector::default()
                    },
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels(app)),
                            ..ObjectMeta::default()
                        }),
                        spec: None,
                    },
                    ..DeploymentSpec::default()
                }),
                ..Deployment::default()
            })
        }

        async fn pass(&self, name: &str) -> std::result::Result<Action, ReconcileError> {
            self.deployments.sync_to(&self.deployment_cache);
            self.services.sync_to(&self.service_cache);
            self.reconciler.reconcile(&ObjectKey::new("default", name)).await
        }

        fn service(&self, name: &str) -> Option<Service> {
            self.services.object(&ObjectKey::new("default", name))
        }
    }

    #[tokio::test]
    async fn test_creates_service_for_deployment() {
        let f = fixture();
        let deployment = f.deployment("web", "web");

        assert_eq!(f.pass("web").await.unwrap(), Action::Done);
        let service = f.service("web").unwrap();
        let spec = service.spec.as_ref().unwrap();
        assert_eq!(spec.selector, Some(labels("web")));
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("http"));
        assert_eq!(port.port, 80);
        assert!(is_controlled_by(&service, &deployment));

        // converged
        f.services.clear_operations();
        assert_eq!(f.pass("web").await.unwrap(), Action::Done);
        assert!(f.services.operations().is_empty());
    }

    #[tokio::test]
    async fn test_updates_drifted_selector() {
        let f = fixture();
        f.deployment("web", "web");
        f.pass("web").await.unwrap();

        let mut deployment = f.deployments.object(&ObjectKey::new("default", "web")).unwrap();
        if let Some(template) = deployment.spec.as_mut().and_then(|s| s.template.metadata.as_mut()) {
            template.labels = Some(labels("web-v2"));
        }
        f.deployments.update(&deployment).await.unwrap();
        f.services.clear_operations();

        assert_eq!(f.pass("web").await.unwrap(), Action::Done);
        assert_eq!(
            f.services.operations(),
            vec![Operation::Update(ObjectKey::new("default", "web"))]
        );
        assert_eq!(f.service("web").unwrap().spec.unwrap().selector, Some(labels("web-v2")));
    }

    #[tokio::test]
    async fn test_foreign_service_is_left_alone() {
        let f = fixture();
        f.deployment("web", "web");
        f.services.insert(Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                    uid: "someone-else".to_string(),
                    controller: Some(true),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            ..Service::default()
        });

        assert_eq!(f.pass("web").await.unwrap(), Action::Done);
        assert!(f.services.operations().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_deployment_removes_service() {
        let f = fixture();
        f.deployment("web", "web");
        f.pass("web").await.unwrap();
        f.deployments.delete(&ObjectKey::new("default", "web")).await.unwrap();
        f.services.clear_operations();

        assert_eq!(f.pass("web").await.unwrap(), Action::Done);
        assert_eq!(
            f.services.operations(),
            vec![Operation::Delete(ObjectKey::new("default", "web"))]
        );

        // already gone
        assert_eq!(f.pass("web").await.unwrap(), Action::Done);
    }

    #[tokio::test]
    async fn test_deleted_deployment_keeps_unowned_service() {
        let f = fixture();
        // never cached, e.g. created by a user before the informer caught up
        f.services.insert(Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..Service::default()
        });

        let key = ObjectKey::new("default", "web");
        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::Done);
        assert!(f.services.operations().is_empty());
        assert!(f.service("web").is_some());
    }

    #[tokio::test]
    async fn test_deleted_deployment_rechecks_service_owner() {
        let f = fixture();
        f.deployment("web", "web");
        f.pass("web").await.unwrap();
        f.deployments.delete(&ObjectKey::new("default", "web")).await.unwrap();
        f.deployments.sync_to(&f.deployment_cache);

        // the service was handed over to someone else, the cache has not seen it
        let mut service = f.service("web").unwrap();
        service.metadata.owner_references = None;
        f.services.update(&service).await.unwrap();
        f.services.clear_operations();

        let key = ObjectKey::new("default", "web");
        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::Done);
        assert!(f.services.operations().is_empty());
        assert!(f.service("web").is_some());
    }

    #[tokio::test]
    async fn test_deployment_without_template_labels_is_invalid() {
        let f = fixture();
        let mut deployment = f.deployment("web", "web");
        deployment.spec.as_mut().unwrap().template.metadata = None;
        f.deployments.update(&deployment).await.unwrap();

        let err = f.pass("web").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Invalid(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_ports_match_ignores_defaults() {
        let desired = vec![ServicePort {
            name: Some("http".to_string()),
            port: 80,
            ..ServicePort::default()
        }];
        let defaulted = vec![ServicePort {
            name: Some("http".to_string()),
            port: 80,
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        }];
        assert!(ports_match(Some(&defaulted), Some(&desired)));
        assert!(!ports_match(None, Some(&desired)));
    }
}
