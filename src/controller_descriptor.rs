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

//! Controller descriptor and registry.
//!
//! This module provides the types for describing and registering controllers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::controller::{CancellationToken, Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;

/// Boxed future for async controller construction.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A builder function that creates a controller instance.
///
/// It returns `Ok(Some(controller))` if the controller was created,
/// `Ok(None)` if it chose not to run, or `Err` on a fatal error.
pub type ControllerConstructor = Arc<
    dyn Fn(ControllerContext, CancellationToken) -> BoxFuture<'static, Result<Option<Arc<dyn Controller>>>>
        + Send
        + Sync,
>;

/// Wraps an async function into a [`ControllerConstructor`].
pub fn constructor<F, Fut>(f: F) -> ControllerConstructor
where
    F: Fn(ControllerContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Arc<dyn Controller>>>> + Send + 'static,
{
    Arc::new(
        move |ctx: ControllerContext,
              cancel: CancellationToken|
              -> BoxFuture<'static, Result<Option<Arc<dyn Controller>>>> {
            Box::pin(f(ctx, cancel))
        },
    )
}

/// Descriptor for a controller.
///
/// ```ignore
/// let descriptor = ControllerDescriptor::builder("scalepod")
///     .with_alias("scale-pod")
///     .build(constructor(|ctx, _| async move { Ok(None) }));
/// ```
#[derive(Clone)]
pub struct ControllerDescriptor {
    name: String,

    /// Alternative names accepted by `--controllers`.
    aliases: Vec<String>,

    disabled_by_default: bool,

    constructor: ControllerConstructor,
}

impl ControllerDescriptor {
    /// Creates a new builder for a controller descriptor.
    pub fn builder(name: impl Into<String>) -> Builder {
        Builder::new(name)
    }

    /// Returns the canonical name of this controller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns all aliases for this controller.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Returns the canonical name followed by every alias.
    pub fn names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }

    /// Returns whether this controller is disabled by default.
    pub fn is_disabled_by_default(&self) -> bool {
        self.disabled_by_default
    }

    /// Builds a controller instance from this descriptor.
    pub async fn build_controller(
        &self,
        ctx: ControllerContext,
        cancel: CancellationToken,
    ) -> Result<Option<Arc<dyn Controller>>> {
        (self.constructor)(ctx, cancel).await
    }
}

impl fmt::Debug for ControllerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("disabled_by_default", &self.disabled_by_default)
            .finish()
    }
}

/// Builder for creating [`ControllerDescriptor`] instances.
pub struct Builder {
    name: String,
    aliases: Vec<String>,
    disabled_by_default: bool,
}

impl Builder {
    /// Creates a new builder with the given controller name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            disabled_by_default: false,
        }
    }

    /// Adds an alias for this controller.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Marks this controller as disabled by default.
    pub fn disabled_by_default(mut self) -> Self {
        self.disabled_by_default = true;
        self
    }

    /// Builds the descriptor with the given constructor.
    pub fn build(self, constructor: ControllerConstructor) -> ControllerDescriptor {
        ControllerDescriptor {
            name: self.name,
            aliases: self.aliases,
            disabled_by_default: self.disabled_by_default,
            constructor,
        }
    }
}

/// Registry of all known controllers.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    /// Canonical controller names to their descriptors.
    controllers: HashMap<String, ControllerDescriptor>,

    /// Aliases to canonical names.
    alias_map: HashMap<String, String>,
}

impl ControllerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller descriptor.
    ///
    /// Fails if the name is empty, already registered, or if an alias
    /// collides with another controller's name or alias.
    pub fn register(&mut self, descriptor: ControllerDescriptor) -> Result<&mut Self> {
        let name = descriptor.name().to_string();
        let invalid = |reason: String| ControllerError::InvalidConfig {
            name: name.clone(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("controller name cannot be empty".to_string()));
        }
        if self.controllers.contains_key(&name) || self.alias_map.contains_key(&name) {
            return Err(invalid(format!("controller {name:?} is already registered")));
        }
        for alias in descriptor.aliases() {
            if self.controllers.contains_key(alias) || alias == &name {
                return Err(invalid(format!(
                    "alias {alias:?} conflicts with a controller name"
                )));
            }
            if let Some(existing) = self.alias_map.get(alias) {
                return Err(invalid(format!(
                    "alias {alias:?} is already used by controller {existing:?}"
                )));
            }
        }

        for alias in descriptor.aliases() {
            self.alias_map.insert(alias.clone(), name.clone());
        }
        self.controllers.insert(name, descriptor);
        Ok(self)
    }

    /// Returns the descriptor for the given name or alias.
    pub fn get(&self, name: &str) -> Option<&ControllerDescriptor> {
        self.controllers.get(name).or_else(|| {
            self.alias_map
                .get(name)
                .and_then(|canonical| self.controllers.get(canonical))
        })
    }

    /// Returns all canonical controller names, sorted.
    pub fn controller_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.controllers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns all controller descriptors.
    pub fn controllers(&self) -> impl Iterator<Item = &ControllerDescriptor> {
        self.controllers.values()
    }

    /// Resolves an alias to its canonical name.
    pub fn resolve_alias(&self, name: &str) -> Option<&str> {
        self.alias_map.get(name).map(String::as_str)
    }

    /// Returns the names in `requested` that match no controller or alias.
    pub fn unknown_names<'a>(&self, requested: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut unknown: Vec<String> = requested
            .into_iter()
            .filter(|name| self.get(name).is_none())
            .cloned()
            .collect();
        unknown.sort();
        unknown
    }
}
