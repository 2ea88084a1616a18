//! Rate-limited work queue with retry/backoff and reconciler dispatch.
//!
//! A [`WorkQueue`] is a bounded-rate, fair dispatcher for [`Request`] items.
//! Adding is idempotent while an item is pending, an item being processed has
//! at most one worker at a time, and re-adds during processing are deferred
//! until the in-flight run completes. Each queue is bound at construction to
//! one reconciler shape: plain namespace/name requests, requests tagged with
//! the queue name, or full event requests carrying object payloads.
//!
//! Reconcilers decide what happens next by returning a
//! [`ReconcileOutcome`]; returning an error re-queues the item with
//! exponential backoff combined with a global token bucket.

mod core;
pub(crate) mod ratelimit;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::{Histogram, IntCounter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::core::QueueCore;
use self::ratelimit::RateLimiter;
use crate::{metrics, Result};

/// Default queue name when none is configured
pub const DEFAULT_QUEUE_NAME: &str = "flotilla-queue";

/// Floor for the dequeue pacing interval
pub const MIN_DEQUEUE_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(60);
const DEFAULT_RATE_LIMIT: u32 = 10;
const DEFAULT_RATE_BURST: u32 = 100;
const DEFAULT_THREADINESS: usize = 1;

const METRIC_PREFIX: &str = "workqueue";
const QUEUE_LABEL: &str = "queuename";

/// Shared, read-only object payload carried by event requests.
///
/// Reconcilers downcast to the concrete watched type:
/// `obj.downcast_ref::<Pod>()`.
pub type RawObject = Arc<dyn Any + Send + Sync>;

/// Namespace/name pair identifying an object within one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object namespace; empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Build a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// An [`ObjectKey`] wrapped with the name of the queue that carries it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaggedRequest {
    /// The object the request refers to
    pub key: ObjectKey,
    /// Name of the queue that dispatched the request
    pub queue: String,
}

/// Kind of informer notification an event request was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Object appeared
    Added,
    /// Object changed
    Updated,
    /// Object went away
    Deleted,
}

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A filtered informer notification with deep-copied object payloads.
///
/// Every event request carries a process-unique sequence number, so two
/// events for the same object never coalesce in the queue and a newer payload
/// is never silently dropped in favor of an older queued one.
#[derive(Clone)]
pub struct EventRequest {
    /// What happened
    pub kind: EventKind,
    /// Key of the object the event refers to
    pub key: ObjectKey,
    /// Previous object state; present only for updates
    pub old: Option<RawObject>,
    /// Current object state (the deleted state for deletions)
    pub new: RawObject,
    seq: u64,
}

impl EventRequest {
    /// Event request for an object that appeared
    pub fn added(key: ObjectKey, new: RawObject) -> Self {
        Self::build(EventKind::Added, key, None, new)
    }

    /// Event request for an object that changed
    pub fn updated(key: ObjectKey, old: RawObject, new: RawObject) -> Self {
        Self::build(EventKind::Updated, key, Some(old), new)
    }

    /// Event request for an object that went away
    pub fn deleted(key: ObjectKey, last: RawObject) -> Self {
        Self::build(EventKind::Deleted, key, None, last)
    }

    fn build(kind: EventKind, key: ObjectKey, old: Option<RawObject>, new: RawObject) -> Self {
        Self {
            kind,
            key,
            old,
            new,
            seq: EVENT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for EventRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRequest")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("seq", &self.seq)
            .finish()
    }
}

impl PartialEq for EventRequest {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.key == other.key && self.seq == other.seq
    }
}

impl Eq for EventRequest {}

impl Hash for EventRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.key.hash(state);
        self.seq.hash(state);
    }
}

/// A work-queue item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    /// Plain namespace/name request
    Object(ObjectKey),
    /// Request tagged with its queue name
    Tagged(TaggedRequest),
    /// Event request carrying object payloads
    Event(EventRequest),
}

/// What a reconciler wants done with the item it just processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Item is finished; reset its failure count
    Done,
    /// Re-queue the item subject to rate limiting
    Requeue,
    /// Reset the failure count and re-queue after the given delay
    RequeueAfter(Duration),
}

/// Error type reconcilers return; it only feeds metrics and backoff
pub type ReconcileError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a single reconcile invocation
pub type ReconcileResult = std::result::Result<ReconcileOutcome, ReconcileError>;

/// Reconciler for plain namespace/name requests
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Process one item
    async fn reconcile(&self, key: ObjectKey) -> ReconcileResult;
}

/// Reconciler for requests tagged with the queue name
#[async_trait]
pub trait TaggedReconciler: Send + Sync {
    /// Process one item
    async fn reconcile(&self, request: TaggedRequest) -> ReconcileResult;
}

/// Reconciler invoked per event kind
#[async_trait]
pub trait EventReconciler: Send + Sync {
    /// Object appeared
    async fn on_add(&self, queue: &str, obj: RawObject) -> ReconcileResult;
    /// Object changed
    async fn on_update(&self, queue: &str, old: Option<RawObject>, new: RawObject)
        -> ReconcileResult;
    /// Object went away
    async fn on_delete(&self, queue: &str, obj: RawObject) -> ReconcileResult;
}

#[derive(Clone)]
enum ReconcilerVariant {
    Plain(Arc<dyn Reconciler>),
    Tagged(Arc<dyn TaggedReconciler>),
    Event(Arc<dyn EventReconciler>),
}

/// Tuning envelope for a [`WorkQueue`]
pub struct QueueConfig {
    /// Queue name; used in logs and metric labels
    pub name: String,
    /// Number of concurrent workers (min 1)
    pub threadiness: usize,
    /// Dequeue pacing; clamped to at least one second
    pub dequeue_interval: Duration,
    /// Exponential backoff floor
    pub backoff_base: Duration,
    /// Exponential backoff ceiling
    pub backoff_ceiling: Duration,
    /// Token bucket refill rate in items per second
    pub rate_limit: u32,
    /// Token bucket burst
    pub rate_burst: u32,
    variant: ReconcilerVariant,
}

impl QueueConfig {
    /// Queue config dispatching plain namespace/name requests
    pub fn new(reconciler: Arc<dyn Reconciler>) -> Self {
        Self::with_variant(DEFAULT_QUEUE_NAME, ReconcilerVariant::Plain(reconciler))
    }

    /// Queue config dispatching requests tagged with `name`
    pub fn tagged(name: impl Into<String>, reconciler: Arc<dyn TaggedReconciler>) -> Self {
        Self::with_variant(name, ReconcilerVariant::Tagged(reconciler))
    }

    /// Queue config dispatching event requests
    pub fn event(name: impl Into<String>, reconciler: Arc<dyn EventReconciler>) -> Self {
        Self::with_variant(name, ReconcilerVariant::Event(reconciler))
    }

    fn with_variant(name: impl Into<String>, variant: ReconcilerVariant) -> Self {
        Self {
            name: name.into(),
            threadiness: DEFAULT_THREADINESS,
            dequeue_interval: MIN_DEQUEUE_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_burst: DEFAULT_RATE_BURST,
            variant,
        }
    }

    /// Clamp the tuning fields and build the queue
    pub fn build(mut self) -> Result<Arc<WorkQueue>> {
        if self.name.is_empty() {
            self.name = DEFAULT_QUEUE_NAME.to_string();
        }
        if self.threadiness < 1 {
            self.threadiness = DEFAULT_THREADINESS;
        }
        if self.dequeue_interval < MIN_DEQUEUE_INTERVAL {
            self.dequeue_interval = MIN_DEQUEUE_INTERVAL;
        }

        let stats = QueueStats::for_queue(&self.name)?;
        Ok(Arc::new(WorkQueue {
            name: self.name,
            threadiness: self.threadiness,
            dequeue_interval: self.dequeue_interval,
            core: Arc::new(QueueCore::new()),
            limiter: Arc::new(RateLimiter::new(
                self.backoff_base,
                self.backoff_ceiling,
                self.rate_limit,
                self.rate_burst,
            )),
            stats: Arc::new(stats),
            variant: self.variant,
        }))
    }
}

struct QueueStats {
    dequeue: IntCounter,
    unexpected: IntCounter,
    reconcile_succ: IntCounter,
    reconcile_fail: IntCounter,
    reconcile_duration: Histogram,
    requeue_after: IntCounter,
    requeue_rate_limit: IntCounter,
}

impl QueueStats {
    fn for_queue(name: &str) -> Result<Self> {
        let metric = metrics::for_prefix(METRIC_PREFIX, None)?;
        let labels: HashMap<String, String> =
            [(QUEUE_LABEL.to_string(), name.to_string())].into();

        Ok(Self {
            dequeue: metric.counter_with_labels("dequeue_total", &labels)?,
            unexpected: metric.counter_with_labels("unexpected_obj_total", &labels)?,
            reconcile_succ: metric.counter_with_labels("reconcile_succ_total", &labels)?,
            reconcile_fail: metric.counter_with_labels("reconcile_fail_total", &labels)?,
            reconcile_duration: metric.summary_with_labels("reconcile_duration", &labels)?,
            requeue_after: metric.counter_with_labels("requeue_after_total", &labels)?,
            requeue_rate_limit: metric.counter_with_labels("requeue_rate_limit_total", &labels)?,
        })
    }
}

/// Rate-limited work queue; see the module docs for the dispatch contract
pub struct WorkQueue {
    name: String,
    threadiness: usize,
    dequeue_interval: Duration,
    core: Arc<QueueCore<Request>>,
    limiter: Arc<RateLimiter<Request>>,
    stats: Arc<QueueStats>,
    variant: ReconcilerVariant,
}

impl WorkQueue {
    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of items waiting to be dequeued
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// True when no items are waiting
    pub fn is_empty(&self) -> bool {
        self.core.len() == 0
    }

    /// Enqueue a request. Idempotent while the item is pending and a no-op
    /// after shutdown.
    pub fn add(&self, request: Request) {
        self.core.add(request);
    }

    /// Enqueue a request after `delay`
    pub fn add_after(&self, request: Request, delay: Duration) {
        if delay.is_zero() {
            self.core.add(request);
            return;
        }
        let core = self.core.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            core.add(request);
        });
    }

    /// Enqueue a request subject to the queue's rate limiter
    pub fn add_rate_limited(&self, request: Request) {
        let delay = self.limiter.when(&request);
        self.add_after(request, delay);
    }

    /// Run `threadiness` workers until `token` is cancelled, then shut the
    /// queue down and wait for in-flight items to complete. Cancellation is
    /// the normal exit path, not an error.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        info!(queue = %self.name, workers = self.threadiness, "starting work queue workers");

        let mut workers = JoinSet::new();
        for _ in 0..self.threadiness {
            let worker = Worker {
                queue: self.name.clone(),
                core: self.core.clone(),
                limiter: self.limiter.clone(),
                stats: self.stats.clone(),
                variant: self.variant.clone(),
            };
            let pacing = self.dequeue_interval;
            let run = token.clone();
            workers.spawn(async move {
                // A worker loop exits when the queue reports shutdown;
                // restarts are paced by the dequeue interval.
                loop {
                    worker.run().await;
                    tokio::select! {
                        _ = run.cancelled() => break,
                        _ = tokio::time::sleep(pacing) => {}
                    }
                }
            });
        }

        token.cancelled().await;
        info!(queue = %self.name, "shutting down work queue workers");
        self.core.shutdown();
        while workers.join_next().await.is_some() {}
        Ok(())
    }
}

struct Worker {
    queue: String,
    core: Arc<QueueCore<Request>>,
    limiter: Arc<RateLimiter<Request>>,
    stats: Arc<QueueStats>,
    variant: ReconcilerVariant,
}

impl Worker {
    async fn run(&self) {
        while let Some(request) = self.core.get().await {
            self.process(request).await;
        }
    }

    async fn process(&self, request: Request) {
        self.stats.dequeue.inc();
        let started = Instant::now();

        if let Some(result) = self.dispatch(request.clone()).await {
            self.stats
                .reconcile_duration
                .observe(started.elapsed().as_secs_f64());
            self.settle(request.clone(), result);
        }

        self.core.done(&request);
    }

    /// Invoke the bound reconciler. Returns `None` when the request shape
    /// does not match the reconciler; the item is forgotten and counted.
    async fn dispatch(&self, request: Request) -> Option<ReconcileResult> {
        match (&self.variant, request) {
            (ReconcilerVariant::Plain(r), Request::Object(key)) => Some(r.reconcile(key).await),
            (ReconcilerVariant::Tagged(r), Request::Object(key)) => {
                Some(
                    r.reconcile(TaggedRequest {
                        key,
                        queue: self.queue.clone(),
                    })
                    .await,
                )
            }
            // A tagged request keeps its original tag through retries.
            (ReconcilerVariant::Tagged(r), Request::Tagged(tagged)) => {
                Some(r.reconcile(tagged).await)
            }
            (ReconcilerVariant::Event(r), Request::Event(event)) => Some(match event.kind {
                EventKind::Added => r.on_add(&self.queue, event.new).await,
                EventKind::Updated => r.on_update(&self.queue, event.old, event.new).await,
                EventKind::Deleted => r.on_delete(&self.queue, event.new).await,
            }),
            (_, unexpected) => {
                warn!(queue = %self.queue, request = ?unexpected, "unexpected request shape in work queue");
                self.limiter.forget(&unexpected);
                self.stats.unexpected.inc();
                None
            }
        }
    }

    fn settle(&self, request: Request, result: ReconcileResult) {
        match result {
            Err(error) => {
                debug!(queue = %self.queue, error = %error, "reconcile failed, requeueing with backoff");
                let delay = self.limiter.when(&request);
                self.add_after(request, delay);
                self.stats.reconcile_fail.inc();
                self.stats.requeue_rate_limit.inc();
            }
            Ok(outcome) => {
                self.stats.reconcile_succ.inc();
                match outcome {
                    ReconcileOutcome::RequeueAfter(delay) if !delay.is_zero() => {
                        self.limiter.forget(&request);
                        self.add_after(request, delay);
                        self.stats.requeue_after.inc();
                    }
                    ReconcileOutcome::Requeue => {
                        let delay = self.limiter.when(&request);
                        self.add_after(request, delay);
                        self.stats.requeue_rate_limit.inc();
                    }
                    ReconcileOutcome::Done | ReconcileOutcome::RequeueAfter(_) => {
                        self.limiter.forget(&request);
                    }
                }
            }
        }
    }

    fn add_after(&self, request: Request, delay: Duration) {
        if delay.is_zero() {
            self.core.add(request);
            return;
        }
        let core = self.core.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            core.add(request);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct ScriptedReconciler {
        /// Outcomes consumed front to back; afterwards everything is Done.
        script: Mutex<Vec<ReconcileResult>>,
        seen: Mutex<Vec<ObjectKey>>,
        invocations: Arc<AtomicU64>,
        done: tokio::sync::Notify,
    }

    impl ScriptedReconciler {
        fn new(script: Vec<ReconcileResult>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
                invocations: Arc::new(AtomicU64::new(0)),
                done: tokio::sync::Notify::new(),
            })
        }
    }

    #[async_trait]
    impl Reconciler for ScriptedReconciler {
        async fn reconcile(&self, key: ObjectKey) -> ReconcileResult {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(key);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                self.done.notify_waiters();
                self.done.notify_one();
                Ok(ReconcileOutcome::Done)
            } else {
                script.remove(0)
            }
        }
    }

    fn fast_queue(name: &str, reconciler: Arc<dyn Reconciler>) -> Arc<WorkQueue> {
        let mut config = QueueConfig::new(reconciler);
        config.name = name.to_string();
        config.backoff_base = Duration::from_millis(10);
        config.backoff_ceiling = Duration::from_millis(100);
        config.rate_limit = 1_000_000;
        config.rate_burst = 1_000_000;
        config.build().unwrap()
    }

    fn spawn_queue(queue: &Arc<WorkQueue>) -> CancellationToken {
        let token = CancellationToken::new();
        let queue = queue.clone();
        let run = token.clone();
        tokio::spawn(async move { queue.start(run).await });
        token
    }

    #[tokio::test]
    async fn error_twice_then_done_retries_with_backoff() {
        let reconciler = ScriptedReconciler::new(vec![
            Err("boom".into()),
            Err("boom again".into()),
        ]);
        let queue = fast_queue("retry_then_done", reconciler.clone());
        let token = spawn_queue(&queue);

        let started = Instant::now();
        queue.add(Request::Object(ObjectKey::new("default", "x")));
        tokio::time::timeout(Duration::from_secs(5), reconciler.done.notified())
            .await
            .expect("reconciler should eventually succeed");

        assert_eq!(reconciler.invocations.load(Ordering::SeqCst), 3);
        // Two backoff rounds at 10ms and 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(queue.stats.reconcile_fail.get(), 2);
        assert_eq!(queue.stats.reconcile_succ.get(), 1);
        assert_eq!(queue.stats.requeue_rate_limit.get(), 2);
        token.cancel();
    }

    #[tokio::test]
    async fn requeue_after_skips_the_rate_limiter() {
        let reconciler = ScriptedReconciler::new(vec![Ok(ReconcileOutcome::RequeueAfter(
            Duration::from_millis(100),
        ))]);
        let queue = fast_queue("requeue_after", reconciler.clone());
        let token = spawn_queue(&queue);

        let started = Instant::now();
        queue.add(Request::Object(ObjectKey::new("default", "x")));
        tokio::time::timeout(Duration::from_secs(5), reconciler.done.notified())
            .await
            .expect("item should be re-processed");

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(reconciler.invocations.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats.requeue_after.get(), 1);
        assert_eq!(queue.stats.requeue_rate_limit.get(), 0);
        token.cancel();
    }

    #[tokio::test]
    async fn requeue_outcome_goes_through_the_rate_limiter() {
        let reconciler = ScriptedReconciler::new(vec![Ok(ReconcileOutcome::Requeue)]);
        let queue = fast_queue("requeue_now", reconciler.clone());
        let token = spawn_queue(&queue);

        queue.add(Request::Object(ObjectKey::new("default", "x")));
        tokio::time::timeout(Duration::from_secs(5), reconciler.done.notified())
            .await
            .expect("item should be re-processed");

        assert_eq!(reconciler.invocations.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats.requeue_rate_limit.get(), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn unexpected_shape_is_forgotten_and_counted() {
        let reconciler = ScriptedReconciler::new(vec![]);
        let queue = fast_queue("unexpected_shape", reconciler.clone());
        let token = spawn_queue(&queue);

        queue.add(Request::Event(EventRequest::added(
            ObjectKey::new("default", "x"),
            Arc::new(42u32),
        )));
        queue.add(Request::Object(ObjectKey::new("default", "y")));
        tokio::time::timeout(Duration::from_secs(5), reconciler.done.notified())
            .await
            .expect("well-shaped item should still be processed");

        assert_eq!(queue.stats.unexpected.get(), 1);
        assert_eq!(reconciler.invocations.load(Ordering::SeqCst), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn add_after_shutdown_is_a_no_op() {
        let reconciler = ScriptedReconciler::new(vec![]);
        let queue = fast_queue("add_after_shutdown", reconciler.clone());
        let token = CancellationToken::new();
        let handle = {
            let queue = queue.clone();
            let run = token.clone();
            tokio::spawn(async move { queue.start(run).await })
        };

        token.cancel();
        handle.await.unwrap().unwrap();

        queue.add(Request::Object(ObjectKey::new("default", "late")));
        assert!(queue.is_empty());
        assert_eq!(reconciler.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tagged_requests_keep_their_queue_name() {
        struct CaptureTagged {
            tags: Mutex<Vec<String>>,
            done: tokio::sync::Notify,
        }

        #[async_trait]
        impl TaggedReconciler for CaptureTagged {
            async fn reconcile(&self, request: TaggedRequest) -> ReconcileResult {
                self.tags.lock().unwrap().push(request.queue);
                self.done.notify_one();
                Ok(ReconcileOutcome::Done)
            }
        }

        let reconciler = Arc::new(CaptureTagged {
            tags: Mutex::new(Vec::new()),
            done: tokio::sync::Notify::new(),
        });
        let queue = QueueConfig::tagged("cluster-a", reconciler.clone())
            .build()
            .unwrap();
        let token = spawn_queue(&queue);

        queue.add(Request::Object(ObjectKey::new("default", "x")));
        tokio::time::timeout(Duration::from_secs(5), reconciler.done.notified())
            .await
            .unwrap();

        // A pre-tagged retry keeps its original tag.
        queue.add(Request::Tagged(TaggedRequest {
            key: ObjectKey::new("default", "x"),
            queue: "cluster-a".to_string(),
        }));
        tokio::time::timeout(Duration::from_secs(5), reconciler.done.notified())
            .await
            .unwrap();

        let tags = reconciler.tags.lock().unwrap().clone();
        assert_eq!(tags, vec!["cluster-a".to_string(), "cluster-a".to_string()]);
        token.cancel();
    }

    #[tokio::test]
    async fn event_requests_dispatch_by_kind() {
        #[derive(Default)]
        struct CaptureEvents {
            calls: Mutex<Vec<&'static str>>,
            done: tokio::sync::Notify,
        }

        #[async_trait]
        impl EventReconciler for CaptureEvents {
            async fn on_add(&self, _queue: &str, obj: RawObject) -> ReconcileResult {
                assert_eq!(obj.downcast_ref::<u32>(), Some(&1));
                self.calls.lock().unwrap().push("add");
                Ok(ReconcileOutcome::Done)
            }

            async fn on_update(
                &self,
                _queue: &str,
                old: Option<RawObject>,
                new: RawObject,
            ) -> ReconcileResult {
                assert_eq!(old.unwrap().downcast_ref::<u32>(), Some(&1));
                assert_eq!(new.downcast_ref::<u32>(), Some(&2));
                self.calls.lock().unwrap().push("update");
                Ok(ReconcileOutcome::Done)
            }

            async fn on_delete(&self, _queue: &str, obj: RawObject) -> ReconcileResult {
                assert_eq!(obj.downcast_ref::<u32>(), Some(&2));
                self.calls.lock().unwrap().push("delete");
                self.done.notify_one();
                Ok(ReconcileOutcome::Done)
            }
        }

        let reconciler = Arc::new(CaptureEvents::default());
        let queue = QueueConfig::event("events", reconciler.clone())
            .build()
            .unwrap();
        let token = spawn_queue(&queue);

        let key = ObjectKey::new("default", "x");
        queue.add(Request::Event(EventRequest::added(key.clone(), Arc::new(1u32))));
        queue.add(Request::Event(EventRequest::updated(
            key.clone(),
            Arc::new(1u32),
            Arc::new(2u32),
        )));
        queue.add(Request::Event(EventRequest::deleted(key, Arc::new(2u32))));

        tokio::time::timeout(Duration::from_secs(5), reconciler.done.notified())
            .await
            .unwrap();
        assert_eq!(
            reconciler.calls.lock().unwrap().clone(),
            vec!["add", "update", "delete"]
        );
        token.cancel();
    }

    #[test]
    fn event_requests_for_the_same_key_never_coalesce() {
        let key = ObjectKey::new("default", "x");
        let a = EventRequest::added(key.clone(), Arc::new(1u32));
        let b = EventRequest::added(key, Arc::new(1u32));
        assert_ne!(Request::Event(a), Request::Event(b));
    }

    #[tokio::test]
    async fn duplicate_adds_reconcile_at_most_once_concurrently() {
        let reconciler = ScriptedReconciler::new(vec![]);
        let queue = fast_queue("duplicate_adds", reconciler.clone());
        let token = spawn_queue(&queue);

        let key = ObjectKey::new("default", "x");
        for _ in 0..10 {
            queue.add(Request::Object(key.clone()));
        }

        tokio::time::timeout(Duration::from_secs(5), reconciler.done.notified())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let invocations = reconciler.invocations.load(Ordering::SeqCst);
        assert!(invocations >= 1 && invocations <= 10, "got {invocations}");
        token.cancel();
    }

    #[tokio::test]
    async fn config_clamps_to_sane_values() {
        let reconciler = ScriptedReconciler::new(vec![]);
        let mut config = QueueConfig::new(reconciler);
        config.name = String::new();
        config.threadiness = 0;
        config.dequeue_interval = Duration::from_millis(1);
        let queue = config.build().unwrap();

        assert_eq!(queue.name(), DEFAULT_QUEUE_NAME);
        assert_eq!(queue.threadiness, 1);
    }
}
