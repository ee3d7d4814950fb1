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

//! The worker loop shared by every controller.
//!
//! Workers pull keys from a [`WorkQueue`], run one reconciliation pass per key
//! and translate the outcome back into queue operations:
//!
//! | outcome                  | queue                              |
//! |--------------------------|------------------------------------|
//! | `Action::Done`           | `forget`                           |
//! | `Action::Requeue`        | `add_rate_limited`                 |
//! | `Action::RequeueAfter`   | `forget`, then `add_after`         |
//! | transient error          | `add_rate_limited`                 |
//! | permanent error          | `forget`                           |
//!
//! `done` is called after every pass, whatever its outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::key::ObjectKey;
use crate::reconciler::{Action, ReconcileError, Reconciler};
use crate::workqueue::WorkQueue;

/// Runs `workers` concurrent workers until `cancel` fires.
///
/// On cancellation the queue is shut down, and this returns once every worker
/// has finished the pass it was running.
pub async fn run_workers<R>(
    name: &str,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    workers: usize,
    timeout: Duration,
    cancel: CancellationToken,
) where
    R: Reconciler + ?Sized,
{
    let workers = workers.max(1);
    tracing::info!(controller = %name, workers, "starting workers");

    let mut set = JoinSet::new();
    for id in 0..workers {
        let name = name.to_string();
        let queue = queue.clone();
        let reconciler = Arc::clone(&reconciler);
        set.spawn(async move {
            while process_next_item(&name, &queue, &reconciler, timeout).await {}
            tracing::trace!(controller = %name, worker = id, "worker stopped");
        });
    }

    cancel.cancelled().await;
    tracing::info!(controller = %name, "shutting down workers");
    queue.shut_down();

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            tracing::error!(controller = %name, error = %e, "worker task failed");
        }
    }
    tracing::info!(controller = %name, "workers stopped");
}

/// Processes a single key. Returns false once the queue has shut down.
async fn process_next_item<R>(
    name: &str,
    queue: &WorkQueue<ObjectKey>,
    reconciler: &Arc<R>,
    timeout: Duration,
) -> bool
where
    R: Reconciler + ?Sized,
{
    let Some(key) = queue.get().await else {
        return false;
    };

    let span = tracing::info_span!("reconcile", controller = %name, key = %key);
    let outcome = reconcile_isolated(reconciler, &key, timeout)
        .instrument(span.clone())
        .await;

    let _entered = span.enter();
    match outcome {
        Ok(Action::Done) => {
            tracing::debug!("reconciled");
            queue.forget(&key);
        }
        Ok(Action::Requeue) => {
            tracing::debug!("requeueing");
            queue.add_rate_limited(key.clone());
        }
        Ok(Action::RequeueAfter(delay)) => {
            tracing::debug!(?delay, "requeueing after delay");
            queue.forget(&key);
            queue.add_after(key.clone(), delay);
        }
        Err(err) if err.is_transient() => {
            tracing::warn!(
                error = %err,
                requeues = queue.num_requeues(&key),
                "reconcile failed, retrying"
            );
            queue.add_rate_limited(key.clone());
        }
        Err(err) => {
            tracing::error!(error = %err, "reconcile failed, dropping key");
            queue.forget(&key);
        }
    }
    queue.done(&key);
    true
}

/// Runs one pass on its own task so a panic cannot take the worker down, and
/// drops the pass if it outlives `timeout`.
async fn reconcile_isolated<R>(
    reconciler: &Arc<R>,
    key: &ObjectKey,
    timeout: Duration,
) -> Result<Action, ReconcileError>
where
    R: Reconciler + ?Sized,
{
    let reconciler = Arc::clone(reconciler);
    let owned = key.clone();
    let pass = tokio::spawn(
        async move { tokio::time::timeout(timeout, reconciler.reconcile(&owned)).await }
            .in_current_span(),
    );

    match pass.await {
        Ok(Ok(result)) => result,
        Ok(Err(_elapsed)) => Err(ReconcileError::Timeout(timeout)),
        Err(e) => Err(ReconcileError::Transient(
            format!("reconcile task failed: {e}").into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::rate_limiter::ItemExponentialFailureRateLimiter;

    type Step = fn(usize) -> Result<Action, ReconcileError>;

    /// Answers each call with `step(call_index)`, optionally sleeping first.
    struct Scripted {
        step: Step,
        delay: fn(usize) -> Duration,
        calls: AtomicUsize,
        completed: AtomicUsize,
        in_flight: Mutex<HashMap<ObjectKey, usize>>,
        max_in_flight: AtomicUsize,
    }

    impl Scripted {
        fn new(step: Step) -> Arc<Self> {
            Self::with_delay(step, |_| Duration::ZERO)
        }

        fn with_delay(step: Step, delay: fn(usize) -> Duration) -> Arc<Self> {
            Arc::new(Self {
                step,
                delay,
                calls: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                in_flight: Mutex::new(HashMap::new()),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reconciler for Scripted {
        async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let n = in_flight.entry(key.clone()).or_default();
                *n += 1;
                self.max_in_flight.fetch_max(*n, Ordering::SeqCst);
            }

            let delay = (self.delay)(call);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            *self.in_flight.lock().unwrap().get_mut(key).unwrap() -= 1;
            self.completed.fetch_add(1, Ordering::SeqCst);
            (self.step)(call)
        }
    }

    fn new_queue() -> WorkQueue<ObjectKey> {
        WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1)),
        )
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "example")
    }

    struct Running {
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Running {
        async fn stop(self) {
            self.cancel.cancel();
            self.handle.await.unwrap();
        }
    }

    fn start<R: Reconciler>(
        queue: &WorkQueue<ObjectKey>,
        reconciler: &Arc<R>,
        workers: usize,
        timeout: Duration,
    ) -> Running {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_workers(
            "test",
            queue.clone(),
            Arc::clone(reconciler),
            workers,
            timeout,
            cancel.clone(),
        ));
        Running { cancel, handle }
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_forgets_key() {
        let queue = new_queue();
        let reconciler = Scripted::new(|_| Ok(Action::Done));
        let running = start(&queue, &reconciler, 1, Duration::from_secs(30));

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(reconciler.calls(), 1);
        assert_eq!(queue.num_requeues(&key()), 0);
        assert!(queue.is_empty());
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_runs_until_done() {
        let queue = new_queue();
        let reconciler = Scripted::new(|call| {
            if call < 3 {
                Ok(Action::Requeue)
            } else {
                Ok(Action::Done)
            }
        });
        let running = start(&queue, &reconciler, 1, Duration::from_secs(30));

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(reconciler.calls(), 4);
        assert_eq!(queue.num_requeues(&key()), 0);
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried() {
        let queue = new_queue();
        let reconciler = Scripted::new(|call| {
            if call < 2 {
                Err(ReconcileError::Transient("apiserver unavailable".into()))
            } else {
                Ok(Action::Done)
            }
        });
        let running = start(&queue, &reconciler, 1, Duration::from_secs(30));

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(reconciler.calls(), 3);
        assert_eq!(queue.num_requeues(&key()), 0);
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_drops_key() {
        let queue = new_queue();
        let reconciler = Scripted::new(|_| Err(ReconcileError::NotFound("gone".into())));
        let running = start(&queue, &reconciler, 1, Duration::from_secs(30));

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(reconciler.calls(), 1);
        assert_eq!(queue.num_requeues(&key()), 0);
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_waits_for_delay() {
        let queue = new_queue();
        let reconciler = Scripted::new(|call| {
            if call == 0 {
                Ok(Action::RequeueAfter(Duration::from_secs(60)))
            } else {
                Ok(Action::Done)
            }
        });
        let running = start(&queue, &reconciler, 1, Duration::from_secs(30));

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(reconciler.calls(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(reconciler.calls(), 2);
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_pass_is_retried() {
        let queue = new_queue();
        let reconciler = Scripted::with_delay(
            |_| Ok(Action::Done),
            |call| {
                if call == 0 {
                    Duration::from_secs(3600)
                } else {
                    Duration::ZERO
                }
            },
        );
        let running = start(&queue, &reconciler, 1, Duration::from_secs(1));

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(reconciler.calls(), 2);
        // the first pass was dropped at its deadline
        assert_eq!(reconciler.completed.load(Ordering::SeqCst), 1);
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_pass_does_not_kill_worker() {
        let queue = new_queue();
        let reconciler = Scripted::new(|call| {
            if call == 0 {
                panic!("boom");
            }
            Ok(Action::Done)
        });
        let running = start(&queue, &reconciler, 1, Duration::from_secs(30));

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.add(ObjectKey::new("default", "other"));
        tokio::time::sleep(Duration::from_secs(10)).await;

        // the panicking key is retried, and the worker keeps serving others
        assert_eq!(reconciler.calls(), 3);
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_is_never_processed_concurrently() {
        let queue = new_queue();
        let reconciler =
            Scripted::with_delay(|_| Ok(Action::Done), |_| Duration::from_millis(100));
        let running = start(&queue, &reconciler, 4, Duration::from_secs(30));

        for _ in 0..20 {
            queue.add(key());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(reconciler.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(reconciler.calls() >= 2);
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_pass() {
        let queue = new_queue();
        let reconciler =
            Scripted::with_delay(|_| Ok(Action::Done), |_| Duration::from_secs(5));
        let running = start(&queue, &reconciler, 2, Duration::from_secs(30));

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.calls(), 1);

        running.stop().await;
        assert_eq!(reconciler.completed.load(Ordering::SeqCst), 1);
        assert!(queue.is_shutting_down());
    }
}
