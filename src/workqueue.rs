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

//! A deduplicating, rate-limited work queue.
//!
//! The queue hands out each item to at most one worker at a time:
//!
//! - An item added while it is already queued is coalesced with the queued
//!   entry.
//! - An item added while a worker is processing it is parked and re-queued
//!   once the worker calls [`WorkQueue::done`].
//! - [`WorkQueue::add_rate_limited`] delays the item by the configured
//!   [`RateLimiter`], [`WorkQueue::forget`] resets that delay.
//!
//! The queue is a cheap handle: clones share the same underlying state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::rate_limiter::RateLimiter;

/// Deadline used for delays that overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deduplicating work queue with per-item rate limiting.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
    shutdown: CancellationToken,
}

struct State<T> {
    /// Items ready to be handed out, in order.
    queue: VecDeque<T>,

    /// Items that need processing: everything in `queue`, plus items re-added
    /// while they were being processed.
    dirty: HashSet<T>,

    /// Items currently held by a worker.
    processing: HashSet<T>,

    /// Items scheduled through `add_after`, with their deadline.
    waiting: HashMap<T, Instant>,

    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    /// Creates a named queue using the given rate limiter for retries.
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Returns the name of this queue.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the item as needing processing.
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // surfaces again in `done`
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Adds the item once `delay` has elapsed.
    ///
    /// If the item is already waiting, the earlier deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let now = Instant::now();
        let ready_at = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if matches!(state.waiting.get(&item), Some(existing) if *existing <= ready_at) {
                return;
            }
            state.waiting.insert(item.clone(), ready_at);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shared.shutdown.cancelled() => {}
                _ = tokio::time::sleep_until(ready_at) => {
                    let due = {
                        let mut state = queue.lock();
                        if state.waiting.get(&item) == Some(&ready_at) {
                            state.waiting.remove(&item);
                            true
                        } else {
                            false
                        }
                    };
                    if due {
                        queue.add(item);
                    }
                }
            }
        });
    }

    /// Adds the item after the rate limiter says it is ok.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.rate_limiter.when(&item);
        tracing::trace!(queue = %self.shared.name, ?item, ?delay, "rate limited requeue");
        self.add_after(item, delay);
    }

    /// Resets the rate limiter for the item.
    ///
    /// This does not remove the item from the queue.
    pub fn forget(&self, item: &T) {
        self.shared.rate_limiter.forget(item);
    }

    /// Returns how many times the item has been requeued with backoff.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.rate_limiter.num_requeues(item)
    }

    /// Waits for the next item.
    ///
    /// Returns `None` once the queue is shutting down. Every item returned must
    /// be released with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Marks the item as no longer being processed.
    ///
    /// If the item was added again while it was processed, it is queued now.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.shutting_down || !state.dirty.contains(item) {
            return;
        }
        state.queue.push_back(item.clone());
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Returns the number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no item is ready to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the queue.
    ///
    /// Blocked and future [`WorkQueue::get`] calls return `None`, new items are
    /// ignored and delayed items are dropped. Items held by workers stay valid
    /// until they call [`WorkQueue::done`].
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.waiting.clear();
        }
        tracing::debug!(queue = %self.shared.name, "shutting down work queue");
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
    }

    /// Returns true once [`WorkQueue::shut_down`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
