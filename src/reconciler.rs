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

//! The reconciler interface and the outcome of a reconciliation pass.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::client::ClientError;
use crate::key::{KeyError, ObjectKey};

/// What the worker loop should do after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The owner converged. Its backoff is reset.
    Done,

    /// More convergence steps remain. The key is requeued with backoff so the
    /// next pass measures the changed state.
    Requeue,

    /// Reconcile again after a fixed delay.
    RequeueAfter(Duration),
}

/// Errors that end a reconciliation pass.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The owner is gone. Nothing left to do for this key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write raced with a concurrent modification.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store or cache could not be reached.
    #[error("transient failure: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The key cannot identify an object.
    #[error("malformed key: {0}")]
    MalformedKey(#[from] KeyError),

    /// The pass exceeded its deadline.
    #[error("reconciliation exceeded its deadline of {0:?}")]
    Timeout(Duration),

    /// The object or a request built from it was rejected as invalid.
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl ReconcileError {
    /// Returns true if retrying the key may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReconcileError::Conflict(_) | ReconcileError::Transient(_) | ReconcileError::Timeout(_)
        )
    }
}

impl From<ClientError> for ReconcileError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(msg) => ReconcileError::NotFound(msg),
            ClientError::Conflict(msg) => ReconcileError::Conflict(msg),
            ClientError::Invalid(msg) => ReconcileError::Invalid(msg),
            ClientError::Transient(source) => ReconcileError::Transient(source),
        }
    }
}

/// Drives the objects named by a key toward their desired state.
///
/// A pass must be safe to repeat: the same key is reconciled again whenever
/// anything related to it changes, and after every requeue.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Runs one convergence pass for the owner named by `key`.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}
