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

//! Configuration structures for the controller manager.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration value the controllers cannot run with.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The overall retry rate is zero, negative or not a number.
    #[error("workQueue.qps must be a positive number, got {0}")]
    InvalidQps(f64),

    /// A reconciliation pass would time out immediately.
    #[error("generic.reconcileTimeout must be greater than zero")]
    ZeroReconcileTimeout,
}

/// Main configuration for the scalepod controller manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerManagerConfig {
    /// Generic configuration applicable to all controllers.
    #[serde(default)]
    pub generic: GenericControllerManagerConfig,

    /// ScalePod controller configuration.
    #[serde(default)]
    pub scale_pod: ScalePodControllerConfig,

    /// Routes controller configuration.
    #[serde(default)]
    pub routes: RoutesControllerConfig,

    /// Work queue and retry configuration shared by all controllers.
    #[serde(default)]
    pub work_queue: WorkQueueConfig,
}

impl ControllerManagerConfig {
    /// Rejects values that would stall or crash the controllers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let qps = self.work_queue.qps;
        if !qps.is_finite() || qps <= 0.0 {
            return Err(ConfigError::InvalidQps(qps));
        }
        if self.generic.reconcile_timeout.is_zero() {
            return Err(ConfigError::ZeroReconcileTimeout);
        }
        Ok(())
    }
}

/// Generic configuration applicable to all controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericControllerManagerConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Namespace to watch. Empty watches all namespaces.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Comma-separated list of controllers to enable.
    /// '*' enables all controllers, 'foo' enables the controller named 'foo',
    /// '-foo' disables the controller named 'foo'.
    #[serde(default = "default_controllers")]
    pub controllers: String,

    /// Controllers explicitly enabled, parsed from `controllers`.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub controllers_enabled: HashSet<String>,

    /// Controllers explicitly disabled, parsed from `controllers`.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub controllers_disabled: HashSet<String>,

    /// Minimum resync period for informers. Zero disables resyncs.
    #[serde(default = "default_min_resync_period", with = "humantime_serde")]
    pub min_resync_period: Duration,

    /// The duration between each controller starting.
    #[serde(
        default = "default_controller_start_interval",
        with = "humantime_serde"
    )]
    pub controller_start_interval: Duration,

    /// The maximum time to wait for controllers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// The maximum time to wait for informer caches to sync before a
    /// controller gives up starting.
    #[serde(default = "default_cache_sync_timeout", with = "humantime_serde")]
    pub cache_sync_timeout: Duration,

    /// Deadline for a single reconciliation pass.
    #[serde(default = "default_reconcile_timeout", with = "humantime_serde")]
    pub reconcile_timeout: Duration,

    /// Address for the health check server.
    #[serde(default = "default_bind_address")]
    pub healthz_bind_address: String,

    /// Port for the health check server.
    #[serde(default = "default_healthz_port")]
    pub healthz_bind_port: u16,
}

impl Default for GenericControllerManagerConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            namespace: default_namespace(),
            controllers: default_controllers(),
            controllers_enabled: HashSet::new(),
            controllers_disabled: HashSet::new(),
            min_resync_period: default_min_resync_period(),
            controller_start_interval: default_controller_start_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            cache_sync_timeout: default_cache_sync_timeout(),
            reconcile_timeout: default_reconcile_timeout(),
            healthz_bind_address: default_bind_address(),
            healthz_bind_port: default_healthz_port(),
        }
    }
}

impl GenericControllerManagerConfig {
    /// Splits `controllers` into the enabled and disabled sets.
    pub fn parse_controllers(&mut self) {
        self.controllers_enabled.clear();
        self.controllers_disabled.clear();

        for part in self.controllers.split(',').map(str::trim) {
            if part.is_empty() || part == "*" {
                continue;
            }
            if let Some(name) = part.strip_prefix('-') {
                self.controllers_disabled.insert(name.to_string());
            } else {
                self.controllers_enabled.insert(part.to_string());
            }
        }
    }

    /// Returns true if the controller (or one of its aliases) is enabled.
    pub fn is_controller_enabled(&self, names: &[&str], disabled_by_default: bool) -> bool {
        if names.iter().any(|n| self.controllers_disabled.contains(*n)) {
            return false;
        }
        if names.iter().any(|n| self.controllers_enabled.contains(*n)) {
            return true;
        }
        let wildcard = self.controllers.split(',').any(|p| p.trim() == "*");
        wildcard && !disabled_by_default
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_controllers() -> String {
    "*".to_string()
}

fn default_min_resync_period() -> Duration {
    Duration::from_secs(12 * 60 * 60) // 12 hours
}

fn default_controller_start_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_sync_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_reconcile_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    10257
}

/// ScalePod controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalePodControllerConfig {
    /// Number of ScalePod workers.
    #[serde(default = "default_concurrent_syncs")]
    pub concurrent_scale_pod_syncs: usize,

    /// Image of the container in every managed pod.
    #[serde(default = "default_pod_image")]
    pub pod_image: String,

    /// Command of the container in every managed pod.
    #[serde(default = "default_pod_command")]
    pub pod_command: Vec<String>,

    /// Rely on the store's owner-reference garbage collection to remove
    /// pods of deleted ScalePods. When false the controller deletes them.
    #[serde(default = "default_cascade_deletion_by_store")]
    pub cascade_deletion_by_store: bool,
}

impl Default for ScalePodControllerConfig {
    fn default() -> Self {
        Self {
            concurrent_scale_pod_syncs: default_concurrent_syncs(),
            pod_image: default_pod_image(),
            pod_command: default_pod_command(),
            cascade_deletion_by_store: default_cascade_deletion_by_store(),
        }
    }
}

fn default_concurrent_syncs() -> usize {
    5
}

fn default_pod_image() -> String {
    "busybox".to_string()
}

fn default_pod_command() -> Vec<String> {
    vec!["sleep".to_string(), "3600".to_string()]
}

fn default_cascade_deletion_by_store() -> bool {
    true
}

/// Routes controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutesControllerConfig {
    /// Number of routes workers.
    #[serde(default = "default_concurrent_syncs")]
    pub concurrent_route_syncs: usize,

    /// Port exposed by every managed service.
    #[serde(default = "default_service_port")]
    pub service_port: i32,

    /// Name of the exposed service port.
    #[serde(default = "default_service_port_name")]
    pub service_port_name: String,
}

impl Default for RoutesControllerConfig {
    fn default() -> Self {
        Self {
            concurrent_route_syncs: default_concurrent_syncs(),
            service_port: default_service_port(),
            service_port_name: default_service_port_name(),
        }
    }
}

fn default_service_port() -> i32 {
    80
}

fn default_service_port_name() -> String {
    "http".to_string()
}

/// Work queue retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkQueueConfig {
    /// First retry delay of a failing key.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound of the per-key retry delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Overall retry rate across all keys.
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Overall retry burst across all keys.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

fn default_base_delay() -> Duration {
    Duration::from_millis(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1000)
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    100
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerManagerConfig::default();
        assert_eq!(config.generic.controllers, "*");
        assert_eq!(config.generic.reconcile_timeout, Duration::from_secs(30));
        assert_eq!(config.scale_pod.pod_image, "busybox");
        assert!(config.scale_pod.cascade_deletion_by_store);
        assert_eq!(config.work_queue.base_delay, Duration::from_millis(5));
        assert_eq!(config.work_queue.max_delay, Duration::from_secs(1000));
    }

    #[test]
    fn test_deserialize_basic_config() {
        let yaml = r#"
generic:
  controllers: "scalepod,-routes"
  minResyncPeriod: 10m
  reconcileTimeout: 5s
scalePod:
  concurrentScalePodSyncs: 2
  podImage: nginx
  cascadeDeletionByStore: false
workQueue:
  baseDelay: 10ms
  maxDelay: 5m
"#;

        let config: ControllerManagerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.generic.controllers, "scalepod,-routes");
        assert_eq!(config.generic.min_resync_period, Duration::from_secs(600));
        assert_eq!(config.generic.reconcile_timeout, Duration::from_secs(5));
        assert_eq!(config.generic.namespace, "default");
        assert_eq!(config.scale_pod.concurrent_scale_pod_syncs, 2);
        assert_eq!(config.scale_pod.pod_image, "nginx");
        assert_eq!(config.scale_pod.pod_command, vec!["sleep", "3600"]);
        assert!(!config.scale_pod.cascade_deletion_by_store);
        assert_eq!(config.routes.service_port, 80);
        assert_eq!(config.work_queue.base_delay, Duration::from_millis(10));
        assert_eq!(config.work_queue.max_delay, Duration::from_secs(300));
        assert_eq!(config.work_queue.burst, 100);
    }

    #[test]
    fn test_validate_rejects_stalling_values() {
        let mut config = ControllerManagerConfig::default();
        assert_eq!(config.validate(), Ok(()));

        for qps in [0.0, -2.0, f64::INFINITY] {
            config.work_queue.qps = qps;
            assert_eq!(config.validate(), Err(ConfigError::InvalidQps(qps)));
        }
        config.work_queue.qps = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQps(_))));

        config.work_queue.qps = 0.5;
        config.generic.reconcile_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroReconcileTimeout));
    }

    #[test]
    fn test_deserialize_zero_qps_fails_validation() {
        let config: ControllerManagerConfig =
            serde_yaml::from_str("workQueue:\n  qps: 0\n").unwrap();
        assert_eq!(config.validate(), Err(ConfigError::InvalidQps(0.0)));
    }

    #[test]
    fn test_controller_selection() {
        let mut generic = GenericControllerManagerConfig {
            controllers: "*,-routes".to_string(),
            ..Default::default()
        };
        generic.parse_controllers();

        assert!(generic.is_controller_enabled(&["scalepod"], false));
        assert!(!generic.is_controller_enabled(&["routes"], false));
        assert!(!generic.is_controller_enabled(&["experimental"], true));

        generic.controllers = "routes".to_string();
        generic.parse_controllers();
        assert!(!generic.is_controller_enabled(&["scalepod"], false));
        assert!(generic.is_controller_enabled(&["service-exposer", "routes"], false));
    }
}
