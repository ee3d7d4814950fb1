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

//! Core controller traits and types.
//!
//! This module defines the base interface that all controllers must implement.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ControllerContext;

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The controller could not start, e.g. its caches never synced.
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        /// Controller name.
        name: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The controller stopped with an error after starting.
    #[error("controller {name} runtime error: {source}")]
    Runtime {
        /// Controller name.
        name: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The configuration cannot be used by the controller.
    #[error("invalid configuration for controller {name}: {reason}")]
    InvalidConfig {
        /// Controller name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// The base trait that all controllers must implement.
///
/// A controller watches an owner kind and the kinds it manages, and runs
/// workers that move the managed objects towards the owner's desired state.
///
/// # Lifecycle
///
/// 1. The controller is created via [`ControllerDescriptor::build_controller`](crate::controller_descriptor::ControllerDescriptor::build_controller)
/// 2. [`Controller::run`] is called with a cancellation token
/// 3. The controller runs until the token is cancelled or an error occurs
/// 4. [`Controller::shutdown`] is called to clean up resources
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller.
    ///
    /// Used for logging, queue names and readiness checks.
    fn name(&self) -> &str;

    /// Runs the controller's main loop.
    ///
    /// Blocks until the cancellation token is triggered or a fatal error
    /// occurs. Failing to sync caches before the deadline is fatal.
    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()>;

    /// Readiness of the controller.
    ///
    /// The default implementation always returns `true`.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }

    /// Optional graceful shutdown hook, called after [`Controller::run`]
    /// returns.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    /// Returns the number of workers this controller runs.
    fn worker_count(&self) -> usize {
        1
    }
}
