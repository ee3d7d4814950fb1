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

//! The ScalePod custom resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the owner name on every managed pod.
pub const APP_LABEL: &str = "app";

/// Label carrying the pool version on every managed pod.
pub const VERSION_LABEL: &str = "version";

/// Desired state of a ScalePod.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "app.cumulonimbus",
    version = "v1alpha1",
    kind = "ScalePod",
    plural = "scalepods",
    shortname = "sp",
    namespaced,
    status = "ScalePodStatus",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScalePodSpec {
    /// Desired number of pods.
    #[serde(default)]
    #[schemars(range(min = 1, max = 10))]
    pub replicas: i32,

    /// Version label applied to the managed pods.
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "v0.1".to_string()
}

/// Observed state of a ScalePod. Written by the controller only.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScalePodStatus {
    /// Names of the available pods, sorted.
    #[serde(default)]
    pub pod_names: Vec<String>,

    /// Number of available pods.
    #[serde(default)]
    pub available_replicas: i32,

    /// Latest observations of the ScalePod's state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ScalePodCondition>,
}

/// A condition on a ScalePod.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScalePodCondition {
    /// Type of the condition, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,

    /// `True`, `False` or `Unknown`.
    pub status: String,

    /// Machine-readable reason for the last transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable details.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ScalePod {
    /// Desired replica count, negative values read as zero.
    pub fn desired_replicas(&self) -> usize {
        usize::try_from(self.spec.replicas).unwrap_or(0)
    }

    /// Labels every pod of this ScalePod carries.
    pub fn selector_labels(&self) -> std::collections::BTreeMap<String, String> {
        let name = self.metadata.name.clone().unwrap_or_default();
        [
            (APP_LABEL.to_string(), name),
            (VERSION_LABEL.to_string(), self.spec.version.clone()),
        ]
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_shape() {
        let crd = ScalePod::crd();
        assert_eq!(crd.spec.group, "app.cumulonimbus");
        assert_eq!(crd.spec.names.kind, "ScalePod");
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().unwrap().status.is_some());
    }

    #[test]
    fn test_spec_defaults() {
        let spec: ScalePodSpec = serde_json::from_str(r#"{"replicas": 3}"#).unwrap();
        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.version, "v0.1");
    }

    #[test]
    fn test_status_serialization() {
        let status = ScalePodStatus {
            pod_names: vec!["a".to_string()],
            available_replicas: 1,
            conditions: Vec::new(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"podNames": ["a"], "availableReplicas": 1})
        );
    }

    #[test]
    fn test_selector_labels() {
        let sp = ScalePod::new(
            "web",
            ScalePodSpec {
                replicas: 2,
                version: "v2".to_string(),
            },
        );
        let labels = sp.selector_labels();
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(labels.get("version").map(String::as_str), Some("v2"));
        assert_eq!(sp.desired_replicas(), 2);
    }
}
