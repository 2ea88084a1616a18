//! Watcher plumbing: the informer analog behind `ClusterClient::watch`.
//!
//! Each registered watch runs one watcher stream against the cluster and
//! keeps a by-key cache of the last seen objects. `Apply` events split into
//! create/update (with the previous object), re-lists emit deletes for keys
//! that vanished, and the first completed re-list marks the watch synced.
//! Surviving events are forwarded to the registered handler with the queue.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::EventHandler;
use crate::predicate::Predicate;
use crate::queue::{ObjectKey, WorkQueue};

const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What a watch does with the events it observes.
pub(crate) enum Dispatch<K> {
    /// Filter through predicates and forward to the handler with the queue.
    Handlers {
        queue: Arc<WorkQueue>,
        handler: Arc<dyn EventHandler<K>>,
        predicates: Vec<Arc<dyn Predicate<K>>>,
    },
    /// Maintain the cache and sync state only.
    CacheOnly,
}

impl<K> Dispatch<K> {
    fn create(&self, obj: &K) {
        if let Dispatch::Handlers {
            queue,
            handler,
            predicates,
        } = self
        {
            if predicates.iter().all(|p| p.create(obj)) {
                handler.create(obj, queue);
            }
        }
    }

    fn update(&self, old: &K, new: &K) {
        if let Dispatch::Handlers {
            queue,
            handler,
            predicates,
        } = self
        {
            if predicates.iter().all(|p| p.update(old, new)) {
                handler.update(old, new, queue);
            }
        }
    }

    fn delete(&self, obj: &K) {
        if let Dispatch::Handlers {
            queue,
            handler,
            predicates,
        } = self
        {
            if predicates.iter().all(|p| p.delete(obj)) {
                handler.delete(obj, queue);
            }
        }
    }
}

pub(crate) async fn run_watch<K>(
    api: Api<K>,
    dispatch: Dispatch<K>,
    synced: Arc<AtomicBool>,
    token: CancellationToken,
    resync: Duration,
    cluster: String,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let mut store: HashMap<ObjectKey, K> = HashMap::new();

    'relist: loop {
        let mut stream = Box::pin(watcher(api.clone(), watcher::Config::default()));
        let mut seen: Option<HashSet<ObjectKey>> = None;

        let resync_timer = tokio::time::sleep(if resync.is_zero() {
            // Effectively never; the watcher still re-lists on its own when
            // the API server expires the watch.
            Duration::from_secs(u64::from(u32::MAX))
        } else {
            resync
        });
        tokio::pin!(resync_timer);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(cluster = %cluster, kind = %kind, "watch cancelled");
                    break 'relist;
                }
                _ = &mut resync_timer => {
                    debug!(cluster = %cluster, kind = %kind, "watch resync");
                    continue 'relist;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        handle_event(event, &dispatch, &mut store, &mut seen, &synced);
                    }
                    Some(Err(err)) => {
                        warn!(cluster = %cluster, kind = %kind, error = %err, "watch error, retrying");
                        tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                    }
                    None => {
                        warn!(cluster = %cluster, kind = %kind, "watch stream ended, restarting");
                        tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                        continue 'relist;
                    }
                }
            }
        }
    }
}

fn handle_event<K>(
    event: Event<K>,
    dispatch: &Dispatch<K>,
    store: &mut HashMap<ObjectKey, K>,
    seen: &mut Option<HashSet<ObjectKey>>,
    synced: &Arc<AtomicBool>,
) where
    K: Resource + Clone,
{
    match event {
        Event::Init => {
            *seen = Some(HashSet::new());
        }
        Event::InitApply(obj) | Event::Apply(obj) => {
            let key = key_of(&obj);
            if let Some(seen) = seen.as_mut() {
                seen.insert(key.clone());
            }
            match store.insert(key, obj.clone()) {
                Some(old) => dispatch.update(&old, &obj),
                None => dispatch.create(&obj),
            }
        }
        Event::InitDone => {
            // Objects that vanished between watches surface as deletes here.
            if let Some(seen) = seen.take() {
                let gone: Vec<ObjectKey> = store
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                for key in gone {
                    if let Some(old) = store.remove(&key) {
                        dispatch.delete(&old);
                    }
                }
            }
            synced.store(true, Ordering::Release);
        }
        Event::Delete(obj) => {
            let key = key_of(&obj);
            let last = store.remove(&key);
            dispatch.delete(last.as_ref().unwrap_or(&obj));
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}
