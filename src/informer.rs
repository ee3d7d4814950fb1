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

//! Informers: watch one kind of object, keep a [`Store`] up to date and
//! notify registered handlers about every change.
//!
//! The initial listing is buffered and swapped into the store in one step,
//! so handlers first see a full replay (`Added` for every object) and only
//! then incremental changes. A periodic resync re-delivers every cached object
//! as an `Updated` event with identical old and new versions.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::Store;
use crate::key::ObjectKey;

/// A change notification for one object.
#[derive(Debug)]
pub enum WatchEvent<K> {
    /// The object appeared, either in the initial listing or later.
    Added(Arc<K>),

    /// The object changed, or is being re-delivered by a resync.
    Updated {
        /// Previously cached version.
        old: Arc<K>,
        /// Current version.
        new: Arc<K>,
    },

    /// The object is gone. Carries its last known state.
    Deleted(Arc<K>),
}

impl<K> WatchEvent<K> {
    /// Returns the most recent version of the object.
    pub fn object(&self) -> &Arc<K> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Deleted(obj) => obj,
            WatchEvent::Updated { new, .. } => new,
        }
    }

    /// Returns a short name of the event class for logging.
    pub fn class(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated { .. } => "updated",
            WatchEvent::Deleted(_) => "deleted",
        }
    }
}

/// Callback invoked for every event of an informer.
///
/// Handlers run on the informer task and must not block.
pub type EventHandler<K> = Arc<dyn Fn(&WatchEvent<K>) + Send + Sync>;

/// Function returning the next resync period.
pub type ResyncPeriodFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Watches one kind of object.
pub struct Informer<K>
where
    K: Resource + Clone,
{
    api: Api<K>,
    watcher_config: watcher::Config,
    resync_period: Option<ResyncPeriodFn>,
    processor: EventProcessor<K>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Creates an informer for the objects visible through `api`.
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            watcher_config: watcher::Config::default(),
            resync_period: None,
            processor: EventProcessor::new(Store::new()),
        }
    }

    /// Sets the watcher configuration (label and field selectors, timeouts).
    pub fn with_watcher_config(mut self, config: watcher::Config) -> Self {
        self.watcher_config = config;
        self
    }

    /// Enables periodic resyncs.
    pub fn with_resync_period(mut self, period: ResyncPeriodFn) -> Self {
        self.resync_period = Some(period);
        self
    }

    /// Returns the store filled by this informer.
    pub fn store(&self) -> Store<K> {
        self.processor.store.clone()
    }

    /// Registers a handler. Must be called before [`Informer::run`].
    pub fn add_event_handler(&mut self, handler: impl Fn(&WatchEvent<K>) + Send + Sync + 'static) {
        self.processor.handlers.push(Arc::new(handler));
    }

    /// Runs the watch until `cancel` fires.
    ///
    /// Watch errors are logged and retried with backoff.
    pub async fn run(self, cancel: CancellationToken) {
        let Informer {
            api,
            watcher_config,
            resync_period,
            mut processor,
        } = self;
        let kind = K::kind(&K::DynamicType::default()).to_string();

        let stream = watcher(api, watcher_config).default_backoff();
        futures::pin_mut!(stream);

        let next_resync = || next_resync_at(resync_period.as_ref(), Instant::now());
        let mut resync_at = next_resync();

        tracing::debug!(%kind, "starting informer");
        loop {
            let resync = async move {
                match resync_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync => {
                    tracing::trace!(%kind, "resyncing informer");
                    processor.resync();
                    resync_at = next_resync();
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => processor.process(event),
                    Some(Err(err)) => {
                        tracing::warn!(%kind, error = %err, "watch failed, retrying");
                    }
                    None => {
                        tracing::warn!(%kind, "watch stream ended");
                        break;
                    }
                },
            }
        }
        tracing::debug!(%kind, "informer stopped");
    }
}

/// Returns when the next resync is due. A zero period disables resyncs.
fn next_resync_at(period: Option<&ResyncPeriodFn>, now: Instant) -> Option<Instant> {
    let period = period.map(|period| period()).filter(|period| !period.is_zero())?;
    now.checked_add(period)
}

/// Applies watcher events to a store and dispatches handler notifications.
pub(crate) struct EventProcessor<K> {
    store: Store<K>,
    handlers: Vec<EventHandler<K>>,
    /// Objects of a listing in progress.
    listing: Option<Vec<K>>,
}

impl<K> EventProcessor<K>
where
    K: Resource + Clone,
{
    pub(crate) fn new(store: Store<K>) -> Self {
        Self {
            store,
            handlers: Vec::new(),
            listing: None,
        }
    }

    fn dispatch(&self, event: WatchEvent<K>) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    pub(crate) fn process(&mut self, event: Event<K>) {
        match event {
            Event::Init => self.listing = Some(Vec::new()),
            Event::InitApply(obj) => self.listing.get_or_insert_with(Vec::new).push(obj),
            Event::InitDone => {
                let listing = self.listing.take().unwrap_or_default();
                let mut previous = self.store.replace(listing);

                for new in self.store.state() {
                    let key = match ObjectKey::from_object(new.as_ref()) {
                        Ok(key) => key,
                        Err(_) => continue,
                    };
                    match previous.remove(&key) {
                        Some(old) => self.dispatch(WatchEvent::Updated { old, new }),
                        None => self.dispatch(WatchEvent::Added(new)),
                    }
                }
                for (_, gone) in previous {
                    self.dispatch(WatchEvent::Deleted(gone));
                }
            }
            Event::Apply(obj) => {
                let key = match ObjectKey::from_object(&obj) {
                    Ok(key) => key,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping watch event for unnamed object");
                        return;
                    }
                };
                let old = self.store.apply(obj);
                let Some(new) = self.store.get(&key) else {
                    return;
                };
                match old {
                    Some(old) => self.dispatch(WatchEvent::Updated { old, new }),
                    None => self.dispatch(WatchEvent::Added(new)),
                }
            }
            Event::Delete(obj) => {
                let key = match ObjectKey::from_object(&obj) {
                    Ok(key) => key,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping watch event for unnamed object");
                        return;
                    }
                };
                self.store.remove(&key);
                tracing::trace!(%key, name = %obj.name_any(), "object deleted");
                self.dispatch(WatchEvent::Deleted(Arc::new(obj)));
            }
        }
    }

    pub(crate) fn resync(&self) {
        for obj in self.store.state() {
            self.dispatch(WatchEvent::Updated {
                old: Arc::clone(&obj),
                new: obj,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn add_event_handler(&mut self, handler: impl Fn(&WatchEvent<K>) + Send + Sync + 'static) {
        self.handlers.push(Arc::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::cache::HasSynced;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    fn pod(name: &str, rv: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_resync_period_disables_resync() {
        let now = Instant::now();
        let zero: ResyncPeriodFn = Arc::new(|| Duration::ZERO);
        let minute: ResyncPeriodFn = Arc::new(|| Duration::from_secs(60));

        assert_eq!(next_resync_at(None, now), None);
        assert_eq!(next_resync_at(Some(&zero), now), None);
        assert_eq!(
            next_resync_at(Some(&minute), now),
            Some(now + Duration::from_secs(60))
        );
    }

    fn recording_processor() -> (EventProcessor<Pod>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut processor = EventProcessor::new(Store::new());
        let sink = Arc::clone(&seen);
        processor.add_event_handler(move |event: &WatchEvent<Pod>| {
            sink.lock()
                .unwrap()
                .push(format!("{} {}", event.class(), event.object().name_any()));
        });
        (processor, seen)
    }

    #[test]
    fn test_initial_listing_is_replayed_after_init_done() {
        let (mut processor, seen) = recording_processor();
        let store = processor.store.clone();

        processor.process(Event::Init);
        processor.process(Event::InitApply(pod("a", "1")));
        processor.process(Event::InitApply(pod("b", "1")));
        assert!(seen.lock().unwrap().is_empty());
        assert!(!store.has_synced());

        processor.process(Event::InitDone);
        assert!(store.has_synced());
        assert_eq!(store.len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["added a", "added b"]);
    }

    #[test]
    fn test_incremental_events() {
        let (mut processor, seen) = recording_processor();
        processor.process(Event::Init);
        processor.process(Event::InitDone);

        processor.process(Event::Apply(pod("a", "1")));
        processor.process(Event::Apply(pod("a", "2")));
        processor.process(Event::Delete(pod("a", "3")));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["added a", "updated a", "deleted a"]
        );
        assert!(processor.store.is_empty());
    }

    #[test]
    fn test_relist_reports_vanished_objects() {
        let (mut processor, seen) = recording_processor();
        processor.process(Event::Init);
        processor.process(Event::InitApply(pod("a", "1")));
        processor.process(Event::InitApply(pod("b", "1")));
        processor.process(Event::InitDone);
        seen.lock().unwrap().clear();

        processor.process(Event::Init);
        processor.process(Event::InitApply(pod("b", "2")));
        processor.process(Event::InitApply(pod("c", "1")));
        processor.process(Event::InitDone);

        let mut events = seen.lock().unwrap().clone();
        events.sort();
        assert_eq!(events, vec!["added c", "deleted a", "updated b"]);
    }

    #[test]
    fn test_resync_redelivers_every_object() {
        let (mut processor, seen) = recording_processor();
        processor.process(Event::Init);
        processor.process(Event::InitApply(pod("a", "1")));
        processor.process(Event::InitDone);
        seen.lock().unwrap().clear();

        processor.resync();
        assert_eq!(*seen.lock().unwrap(), vec!["updated a"]);
    }

    #[test]
    fn test_unnamed_objects_are_dropped() {
        let (mut processor, seen) = recording_processor();
        processor.process(Event::Apply(Pod::default()));
        assert!(seen.lock().unwrap().is_empty());
        assert!(processor.store.is_empty());
    }
}
