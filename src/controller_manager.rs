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

//! Controller manager - the main orchestrator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerManagerConfig;
use crate::controller::{Controller, ControllerError, Result};
use crate::controller_context::{resync_period_fn, ControllerContext};
use crate::controller_descriptor::{ControllerDescriptor, ControllerRegistry};
use crate::controllers;
use crate::health::{BoxFuture, HealthChecker, HealthRegistry};

/// Readiness of one running controller.
struct ControllerHealth(Arc<dyn Controller>);

impl HealthChecker for ControllerHealth {
    fn check(&self) -> BoxFuture<'_, bool> {
        self.0.health_check()
    }

    fn name(&self) -> &str {
        self.0.name()
    }
}

/// The controller manager.
///
/// This is the main orchestrator that:
/// 1. Builds the enabled controllers from the registry
/// 2. Provides shared resources (client, config)
/// 3. Handles graceful shutdown
pub struct ControllerManager {
    /// Configuration for this instance.
    config: Arc<ControllerManagerConfig>,

    /// Kubernetes client.
    client: kube::Client,

    /// Registry of all available controllers.
    registry: ControllerRegistry,

    /// Readiness checks of the running controllers.
    health: HealthRegistry,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,

    /// Controllers that are currently running.
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl ControllerManager {
    /// Creates a controller manager with every built-in controller registered.
    pub fn new(config: ControllerManagerConfig, client: kube::Client) -> Result<Self> {
        let mut registry = ControllerRegistry::new();
        controllers::register_all(&mut registry)?;

        Ok(Self {
            config: Arc::new(config),
            client,
            registry,
            health: HealthRegistry::new(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        })
    }

    /// Adds a controller descriptor to the registry.
    pub fn register_controller(&mut self, descriptor: ControllerDescriptor) -> Result<&mut Self> {
        self.registry.register(descriptor)?;
        Ok(self)
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Returns the readiness checks, to be served by a
    /// [`HealthServer`](crate::health::HealthServer).
    pub fn health_registry(&self) -> HealthRegistry {
        self.health.clone()
    }

    /// Runs the controller manager until the shutdown token fires or a
    /// controller fails.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("starting scalepod-controller-manager");

        self.config
            .validate()
            .map_err(|err| ControllerError::InvalidConfig {
                name: "controller-manager".to_string(),
                reason: err.to_string(),
            })?;
        self.validate_controller_names()?;
        let ctx = self.build_controller_context();
        let controllers = self.build_controllers(ctx.clone()).await?;

        if controllers.is_empty() {
            tracing::warn!("no controllers enabled, exiting");
            return Ok(());
        }
        tracing::info!(count = controllers.len(), "built controllers");

        self.run_controllers(ctx, controllers).await
    }

    fn validate_controller_names(&self) -> Result<()> {
        let generic = &self.config.generic;
        let unknown = self.registry.unknown_names(
            generic
                .controllers_enabled
                .iter()
                .chain(generic.controllers_disabled.iter()),
        );
        if unknown.is_empty() {
            return Ok(());
        }
        Err(ControllerError::InvalidConfig {
            name: "controllers".to_string(),
            reason: format!(
                "unknown controllers {unknown:?}, known controllers are {:?}",
                self.registry.controller_names()
            ),
        })
    }

    /// Builds the controller context.
    fn build_controller_context(&self) -> ControllerContext {
        let resync_fn = Arc::new(resync_period_fn(self.config.generic.min_resync_period));
        ControllerContext::new(self.client.clone(), self.config.clone(), resync_fn)
    }

    /// Builds all enabled controllers and registers their readiness checks.
    async fn build_controllers(&self, ctx: ControllerContext) -> Result<Vec<Arc<dyn Controller>>> {
        let mut controllers = Vec::new();

        let mut descriptors: Vec<_> = self.registry.controllers().collect();
        descriptors.sort_by(|a, b| a.name().cmp(b.name()));

        for descriptor in descriptors {
            let name = descriptor.name();
            let enabled = self
                .config
                .generic
                .is_controller_enabled(&descriptor.names(), descriptor.is_disabled_by_default());
            if !enabled {
                tracing::debug!(controller = %name, "controller is disabled");
                continue;
            }

            let cancel = self.shutdown_token.clone();
            match descriptor.build_controller(ctx.clone(), cancel).await {
                Ok(Some(controller)) => {
                    tracing::info!(controller = %name, workers = controller.worker_count(), "built controller");
                    self.health
                        .register(Arc::new(ControllerHealth(Arc::clone(&controller))))
                        .await;
                    controllers.push(controller);
                }
                Ok(None) => {
                    tracing::debug!(controller = %name, "controller chose not to run");
                }
                Err(e) => {
                    tracing::error!(controller = %name, error = %e, "failed to build controller");
                    return Err(ControllerError::StartFailed {
                        name: name.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        Ok(controllers)
    }

    /// Runs all controllers concurrently.
    async fn run_controllers(
        &self,
        ctx: ControllerContext,
        controllers: Vec<Arc<dyn Controller>>,
    ) -> Result<()> {
        let start_interval = self.config.generic.controller_start_interval;

        let mut join_set = JoinSet::new();
        for controller in controllers {
            let name = controller.name().to_string();
            let ctx = ctx.clone();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();

            // spread the initial list calls
            let jitter = rand::random::<f64>();
            let delay = Duration::from_secs_f64(start_interval.as_secs_f64() * (1.0 + jitter));

            join_set.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return (name, Ok(())),
                    _ = tokio::time::sleep(delay) => {}
                }
                tracing::info!(controller = %name, "starting controller");

                running.write().await.insert(name.clone());
                let result = controller.run(ctx, cancel).await;
                running.write().await.remove(&name);

                if let Err(e) = controller.shutdown().await {
                    tracing::warn!(controller = %name, error = %e, "controller shutdown hook failed");
                }

                match &result {
                    Ok(()) => tracing::info!(controller = %name, "controller stopped"),
                    Err(e) => tracing::error!(controller = %name, error = %e, "controller failed"),
                }
                (name, result)
            });
        }

        // the first failing controller takes the whole process down
        let mut failure = None;
        tokio::select! {
            result = async {
                while let Some(result) = join_set.join_next().await {
                    match result {
                        Ok((_, Ok(()))) => {}
                        Ok((_, Err(e))) => return Err(e),
                        Err(e) => {
                            return Err(ControllerError::Runtime {
                                name: "unknown".to_string(),
                                source: e.into(),
                            });
                        }
                    }
                }
                Ok(())
            } => {
                if let Err(e) = result {
                    failure = Some(e);
                    self.shutdown_token.cancel();
                }
            }
            _ = self.shutdown_token.cancelled() => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        self.wait_for_controllers(&mut join_set).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits for the remaining controllers, bounded by the shutdown timeout.
    async fn wait_for_controllers(&self, join_set: &mut JoinSet<(String, Result<()>)>) {
        let deadline = tokio::time::Instant::now() + self.config.generic.shutdown_timeout;

        while !join_set.is_empty() {
            tokio::select! {
                result = join_set.join_next() => match result {
                    Some(Ok((name, Ok(())))) => {
                        tracing::debug!(controller = %name, "controller stopped");
                    }
                    Some(Ok((name, Err(e)))) => {
                        tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "controller task failed");
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let running = self.running_controllers.read().await;
                    tracing::warn!(
                        controllers = ?running.iter().collect::<Vec<_>>(),
                        "shutdown timeout reached, controllers still running"
                    );
                    join_set.abort_all();
                    break;
                }
            }
        }
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    /// Returns the controller registry.
    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_controllers_registered() {
        let mut registry = ControllerRegistry::new();
        controllers::register_all(&mut registry).unwrap();

        assert_eq!(registry.controller_names(), vec!["routes", "scalepod"]);
        assert_eq!(registry.resolve_alias("scale-pod"), Some("scalepod"));
    }

    #[test]
    fn test_builtin_controllers_enabled_by_default() {
        let mut registry = ControllerRegistry::new();
        controllers::register_all(&mut registry).unwrap();
        let mut config = ControllerManagerConfig::default();
        config.generic.controllers = "*,-routes".to_string();
        config.generic.parse_controllers();

        let enabled: Vec<_> = registry
            .controllers()
            .filter(|d| {
                config
                    .generic
                    .is_controller_enabled(&d.names(), d.is_disabled_by_default())
            })
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(enabled, vec!["scalepod"]);
    }
}
