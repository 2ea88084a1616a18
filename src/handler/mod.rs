//! Translators from filtered watch events into work-queue items.
//!
//! An [`EventHandler`] receives the surviving events of a watch (after
//! predicate filtering) together with the queue they should feed. The two
//! built-in handlers cover the common cases: enqueueing the object's
//! namespace/name, and enqueueing the full event with deep-copied payloads.

use std::marker::PhantomData;
use std::sync::Arc;

use kube::{Resource, ResourceExt};

use crate::queue::{EventRequest, ObjectKey, Request, WorkQueue};

/// Receives filtered watch events and turns them into queue items
pub trait EventHandler<K>: Send + Sync {
    /// Object appeared
    fn create(&self, obj: &K, queue: &WorkQueue);
    /// Object changed
    fn update(&self, old: &K, new: &K, queue: &WorkQueue);
    /// Object went away
    fn delete(&self, obj: &K, queue: &WorkQueue);
    /// Out-of-band notification for the object
    fn generic(&self, obj: &K, queue: &WorkQueue);
}

/// Extracts one string from a watched object
pub type ExtractFn<K> = Box<dyn Fn(&K) -> String + Send + Sync>;

/// Enqueues `Request::Object` items derived from the watched object.
///
/// The namespace and name extractors default to the object's own metadata
/// and can be replaced to fan events out to related objects (for example an
/// owner reference).
pub struct NamespacedNameHandler<K> {
    name_fn: ExtractFn<K>,
    namespace_fn: ExtractFn<K>,
}

impl<K: Resource> NamespacedNameHandler<K> {
    /// Handler using the object's own namespace and name
    pub fn new() -> Self {
        Self {
            name_fn: Box::new(|obj: &K| obj.name_any()),
            namespace_fn: Box::new(|obj: &K| obj.namespace().unwrap_or_default()),
        }
    }

    /// Handler with custom namespace and name extractors
    pub fn with_extractors(namespace_fn: ExtractFn<K>, name_fn: ExtractFn<K>) -> Self {
        Self {
            name_fn,
            namespace_fn,
        }
    }

    fn key(&self, obj: &K) -> ObjectKey {
        ObjectKey::new((self.namespace_fn)(obj), (self.name_fn)(obj))
    }
}

impl<K: Resource> Default for NamespacedNameHandler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource + Send + Sync> EventHandler<K> for NamespacedNameHandler<K> {
    fn create(&self, obj: &K, queue: &WorkQueue) {
        queue.add(Request::Object(self.key(obj)));
    }

    fn update(&self, _old: &K, new: &K, queue: &WorkQueue) {
        queue.add(Request::Object(self.key(new)));
    }

    fn delete(&self, obj: &K, queue: &WorkQueue) {
        queue.add(Request::Object(self.key(obj)));
    }

    fn generic(&self, obj: &K, queue: &WorkQueue) {
        queue.add(Request::Object(self.key(obj)));
    }
}

/// Enqueues `Request::Event` items carrying the event kind and deep copies
/// of the objects.
///
/// Watch payloads are shared with every other handler on the informer, so
/// the objects are cloned before they are enqueued; reconcilers may hold or
/// mutate their copy freely. Generic notifications are forwarded as adds.
pub struct EventObjectHandler<K> {
    _marker: PhantomData<fn(K)>,
}

impl<K> EventObjectHandler<K> {
    /// Build the handler
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K> Default for EventObjectHandler<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn object_key<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

impl<K> EventHandler<K> for EventObjectHandler<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn create(&self, obj: &K, queue: &WorkQueue) {
        queue.add(Request::Event(EventRequest::added(
            object_key(obj),
            Arc::new(obj.clone()),
        )));
    }

    fn update(&self, old: &K, new: &K, queue: &WorkQueue) {
        queue.add(Request::Event(EventRequest::updated(
            object_key(new),
            Arc::new(old.clone()),
            Arc::new(new.clone()),
        )));
    }

    fn delete(&self, obj: &K, queue: &WorkQueue) {
        queue.add(Request::Event(EventRequest::deleted(
            object_key(obj),
            Arc::new(obj.clone()),
        )));
    }

    fn generic(&self, obj: &K, queue: &WorkQueue) {
        queue.add(Request::Event(EventRequest::added(
            object_key(obj),
            Arc::new(obj.clone()),
        )));
    }
}
