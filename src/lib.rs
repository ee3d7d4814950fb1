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

//! scalepod-controller - level-triggered reconciliation controllers.
//!
//! This library provides the pieces every controller in this crate is built
//! from, and the controllers themselves:
//! - Informers and caches fed by the Kubernetes watch API
//! - A deduplicating, rate-limited work queue
//! - The worker loop and the reconciler interface
//! - The ScalePod and routes controllers
//! - The controller manager, configuration and health checks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_descriptor;
pub mod controller_manager;
pub mod controllers;
pub mod crd;
pub mod event_handler;
pub mod health;
pub mod informer;
pub mod key;
pub mod memory;
pub mod rate_limiter;
pub mod reconciler;
pub mod worker;
pub mod workqueue;

pub use cache::Store;
pub use client::{ClientError, ObjectClient};
pub use config::{ConfigError, ControllerManagerConfig};
pub use controller::{Controller, ControllerError};
pub use controller_context::ControllerContext;
pub use controller_descriptor::{ControllerDescriptor, ControllerRegistry};
pub use controller_manager::ControllerManager;
pub use crd::{ScalePod, ScalePodSpec, ScalePodStatus};
pub use key::ObjectKey;
pub use reconciler::{Action, ReconcileError, Reconciler};
pub use worker::run_workers;
pub use workqueue::WorkQueue;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
