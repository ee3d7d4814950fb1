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

//! Reconciliation keys.
//!
//! A key names the owner object a reconciliation pass works on. Keys are the
//! unit of work in the [`WorkQueue`](crate::workqueue::WorkQueue), so they are
//! cheap to clone, hashable and totally ordered.

use std::fmt;
use std::str::FromStr;

use kube::Resource;
use thiserror::Error;

/// Errors produced while deriving a key from an object or a string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The object's metadata carries no name.
    #[error("object has no name")]
    MissingName,

    /// The string is not a `namespace/name` pair.
    #[error("invalid key {0:?}: expected <namespace>/<name> or <name>")]
    Malformed(String),
}

/// Namespace and name of an object.
///
/// Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace of the object, empty for cluster-scoped objects.
    pub namespace: String,

    /// Name of the object.
    pub name: String,
}

impl ObjectKey {
    /// Creates a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derives the key of an object from its metadata.
    ///
    /// Objects that only carry a `generateName` have not been persisted yet and
    /// cannot be keyed.
    pub fn from_object<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(KeyError::MissingName)?;
        Ok(Self::new(meta.namespace.clone().unwrap_or_default(), name))
    }

    /// Returns the namespace, or `None` for cluster-scoped keys.
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    #[test]
    fn test_key_from_object() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = ObjectKey::from_object(&pod).unwrap();
        assert_eq!(key, ObjectKey::new("apps", "web-0"));
        assert_eq!(key.to_string(), "apps/web-0");
    }

    #[test]
    fn test_key_requires_name() {
        let pod = Pod {
            metadata: ObjectMeta {
                generate_name: Some("web-".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(ObjectKey::from_object(&pod), Err(KeyError::MissingName));
    }

    #[test]
    fn test_parse_key() {
        assert_eq!("a/b".parse::<ObjectKey>().unwrap(), ObjectKey::new("a", "b"));
        assert_eq!("b".parse::<ObjectKey>().unwrap(), ObjectKey::new("", "b"));
        assert!("a/b/c".parse::<ObjectKey>().is_err());
        assert!("/b".parse::<ObjectKey>().is_err());
        assert!("".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn test_cluster_scoped_key_display() {
        let key = ObjectKey::new("", "node-1");
        assert_eq!(key.namespace(), None);
        assert_eq!(key.to_string(), "node-1");
    }
}
