//! One live cluster connection.
//!
//! A [`ClusterClient`] owns everything tied to a single target cluster: the
//! resolved client configuration, typed API access bounded by an exec
//! timeout, registered watches, the health probe, and the start/stop state
//! machine. Clients are usually built and driven by the fleet supervisor,
//! but stand on their own for single-cluster use.

mod config;
pub(crate) mod watch;

pub use config::ConfigMutator;

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event as EventRecord, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::watch::{run_watch, Dispatch};
use crate::configuration::ClusterDescriptor;
use crate::handler::EventHandler;
use crate::predicate::Predicate;
use crate::queue::ratelimit::TokenBucket;
use crate::queue::{ObjectKey, WorkQueue};
use crate::{
    Error, Result, DEFAULT_BURST, DEFAULT_EXEC_TIMEOUT, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_QPS, DEFAULT_SYNC_PERIOD, MIN_EXEC_TIMEOUT,
};

/// Tuning envelope for one cluster client
#[derive(Clone)]
pub struct Options {
    /// Watcher re-list period; zero disables periodic re-lists
    pub sync_period: Duration,
    /// Interval between health probes; values below one second disable the
    /// probe loop after the first check
    pub health_check_interval: Duration,
    /// Bound for a single API call; clamped to the default when below the
    /// 100ms minimum
    pub exec_timeout: Duration,
    /// Client-side queries-per-second budget; zero disables throttling
    pub qps: u32,
    /// Client-side burst budget; zero disables throttling
    pub burst: u32,
    /// Mutators applied to the resolved `kube::Config`
    pub config_mutators: Vec<ConfigMutator>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_period: DEFAULT_SYNC_PERIOD,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
            config_mutators: Vec::new(),
        }
    }
}

impl Options {
    /// Options with the crate defaults
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lifecycle state of a cluster client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Built but not yet started
    NotStarted,
    /// `start` is running
    Running,
    /// Stopped, either explicitly or through cancellation
    Stopped,
}

const STATE_NOT_STARTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

type WatchLauncher = Box<dyn FnOnce(CancellationToken) + Send>;

struct WatchSet {
    launchers: Vec<WatchLauncher>,
    synced: Vec<Arc<AtomicBool>>,
    run_token: Option<CancellationToken>,
}

/// One live connection to a Kubernetes cluster
pub struct ClusterClient {
    descriptor: ClusterDescriptor,
    options: Options,
    config: kube::Config,
    client: Client,
    reporter: Reporter,
    state: AtomicU8,
    connected: Arc<AtomicBool>,
    throttle: Option<Arc<TokenBucket>>,
    stop: CancellationToken,
    watches: Mutex<WatchSet>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl ClusterClient {
    /// Build a client for the given descriptor.
    ///
    /// Validates the options, resolves the kubeconfig, and constructs the
    /// underlying client. Nothing touches the network until the first API
    /// call or `start`.
    pub async fn new(descriptor: ClusterDescriptor, mut options: Options) -> Result<Self> {
        if descriptor.name.is_empty() {
            return Err(Error::configuration("cluster name is empty"));
        }
        if options.exec_timeout < MIN_EXEC_TIMEOUT {
            warn!(
                cluster = %descriptor.name,
                "exec timeout below 100ms would time out most calls, using default {:?}",
                DEFAULT_EXEC_TIMEOUT,
            );
            options.exec_timeout = DEFAULT_EXEC_TIMEOUT;
        }

        let throttle = if options.qps > 0 && options.burst > 0 {
            info!(
                cluster = %descriptor.name,
                qps = options.qps,
                burst = options.burst,
                "cluster connection uses client-side throttling",
            );
            Some(Arc::new(TokenBucket::new(options.qps, options.burst)))
        } else {
            None
        };

        let config = config::build_kube_config(&descriptor, &options.config_mutators)
            .await
            .map_err(|err| {
                Error::kubeconfig(format!("cluster {}: {err}", descriptor.name))
            })?;
        let client = Client::try_from(config.clone()).map_err(|err| {
            Error::configuration(format!(
                "cluster {} client construction failed: {err}",
                descriptor.name
            ))
        })?;

        let reporter = Reporter {
            controller: descriptor.name.clone(),
            instance: None,
        };

        Ok(Self {
            descriptor,
            options,
            config,
            client,
            reporter,
            state: AtomicU8::new(STATE_NOT_STARTED),
            connected: Arc::new(AtomicBool::new(false)),
            throttle,
            stop: CancellationToken::new(),
            watches: Mutex::new(WatchSet {
                launchers: Vec::new(),
                synced: Vec::new(),
                run_token: None,
            }),
        })
    }

    /// The descriptor this client was built from
    pub fn descriptor(&self) -> &ClusterDescriptor {
        &self.descriptor
    }

    /// Cluster name shorthand
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// The resolved client configuration
    pub fn kube_config(&self) -> &kube::Config {
        &self.config
    }

    /// The underlying Kubernetes client
    pub fn kube_client(&self) -> &Client {
        &self.client
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::Acquire) {
            STATE_RUNNING => ClientState::Running,
            STATE_STOPPED => ClientState::Stopped,
            _ => ClientState::NotStarted,
        }
    }

    /// Latest health probe verdict. Unspecified before the first probe
    /// completes.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// True once the client runs and every registered watch finished its
    /// initial list. A client without watches is synced as soon as it runs.
    pub fn has_synced(&self) -> bool {
        if self.state() != ClientState::Running {
            return false;
        }
        let watches = self.watches.lock().expect("watch mutex poisoned");
        watches
            .synced
            .iter()
            .all(|flag| flag.load(Ordering::Acquire))
    }

    /// Run the client until `token` is cancelled or [`stop`](Self::stop) is
    /// called: launch registered watches, then the health probe, then wait.
    ///
    /// May be invoked at most once per instance; a second call returns an
    /// error. Cancellation is the normal exit path, not an error.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_NOT_STARTED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AlreadyStarted(format!(
                "cluster client {}",
                self.descriptor.name
            )));
        }

        let run = token.child_token();
        {
            // stop() cancels only this client, not the caller's token.
            let stop = self.stop.clone();
            let run = run.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => run.cancel(),
                    _ = run.cancelled() => {}
                }
            });
        }

        {
            let mut watches = self.watches.lock().expect("watch mutex poisoned");
            watches.run_token = Some(run.clone());
            for launch in watches.launchers.drain(..) {
                launch(run.child_token());
            }
        }

        {
            let client = self.client.clone();
            let connected = self.connected.clone();
            let interval = self.options.health_check_interval;
            let timeout = self.options.exec_timeout;
            let cluster = self.descriptor.name.clone();
            let probe_token = run.child_token();
            tokio::spawn(health_loop(
                client,
                connected,
                interval,
                timeout,
                cluster,
                probe_token,
            ));
        }

        info!(cluster = %self.descriptor.name, "cluster client started");
        run.cancelled().await;
        self.state.store(STATE_STOPPED, Ordering::Release);
        info!(cluster = %self.descriptor.name, "cluster client stopped");
        Ok(())
    }

    /// Cancel the client's internal context. Idempotent and safe before
    /// `start`; a client stopped before starting exits `start` immediately.
    pub fn stop(&self) {
        debug!(cluster = %self.descriptor.name, "cluster client stop requested");
        self.stop.cancel();
    }

    /// Cluster-wide API handle for `K`
    pub fn api<K>(&self) -> Api<K>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    /// Namespaced API handle for `K`
    pub fn namespaced_api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Register a watch: events for `K` flow through `predicates` into
    /// `handler` with `queue`.
    ///
    /// Watches registered before `start` launch when the client starts;
    /// registrations on a running client launch immediately. The queue's
    /// lifetime must cover the client's.
    pub fn watch<K>(
        &self,
        queue: Arc<WorkQueue>,
        handler: Arc<dyn EventHandler<K>>,
        predicates: Vec<Arc<dyn Predicate<K>>>,
    ) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        self.register_watch(Dispatch::Handlers {
            queue,
            handler,
            predicates,
        })
    }

    /// Register a cache-only watch for `K`.
    ///
    /// No events are dispatched; the watch only contributes to
    /// [`has_synced`](Self::has_synced), which makes it useful for warming
    /// up before serving.
    pub fn sync<K>(&self) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        self.register_watch::<K>(Dispatch::CacheOnly)
    }

    fn register_watch<K>(&self, dispatch: Dispatch<K>) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        if self.state() == ClientState::Stopped {
            return Err(Error::configuration(format!(
                "cluster {} is stopped",
                self.descriptor.name
            )));
        }

        let api: Api<K> = Api::all(self.client.clone());
        let synced = Arc::new(AtomicBool::new(false));
        let resync = self.options.sync_period;
        let cluster = self.descriptor.name.clone();

        let flag = synced.clone();
        let launcher: WatchLauncher = Box::new(move |token| {
            tokio::spawn(run_watch(api, dispatch, flag, token, resync, cluster));
        });

        let mut guard = self.watches.lock().expect("watch mutex poisoned");
        let watches = &mut *guard;
        watches.synced.push(synced);
        match (&watches.run_token, self.state()) {
            (Some(run), ClientState::Running) => launcher(run.child_token()),
            _ => watches.launchers.push(launcher),
        }
        Ok(())
    }

    /// Fetch one object by key
    pub async fn get<K>(&self, key: &ObjectKey) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api = self.namespaced_api::<K>(&key.namespace);
        self.bounded("get", api.get(&key.name)).await
    }

    /// List objects, in one namespace or across the cluster
    pub async fn list<K>(
        &self,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ObjectList<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = match namespace {
            Some(namespace) => self.namespaced_api(namespace),
            None => Api::all(self.client.clone()),
        };
        self.bounded("list", api.list(params)).await
    }

    /// Create an object in its metadata namespace
    pub async fn create<K>(&self, obj: &K, params: &PostParams) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let api = self.api_for(obj);
        self.bounded("create", api.create(params, obj)).await
    }

    /// Replace an object with the given state
    pub async fn update<K>(&self, obj: &K, params: &PostParams) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        let api = self.api_for(obj);
        self.bounded("update", api.replace(&name, params, obj)).await
    }

    /// Replace an object's status subresource with the given state
    pub async fn update_status<K>(&self, obj: &K, params: &PostParams) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        let data = serde_json::to_vec(obj).map_err(|err| Error::serialization(err.to_string()))?;
        let api = self.api_for(obj);
        self.bounded("update status", api.replace_status(&name, params, data))
            .await
    }

    /// Patch an object
    pub async fn patch<K, P>(
        &self,
        key: &ObjectKey,
        params: &PatchParams,
        patch: &Patch<P>,
    ) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
        P: Serialize + Debug,
    {
        let api = self.namespaced_api::<K>(&key.namespace);
        self.bounded("patch", api.patch(&key.name, params, patch))
            .await
    }

    /// Patch an object's status subresource
    pub async fn patch_status<K, P>(
        &self,
        key: &ObjectKey,
        params: &PatchParams,
        patch: &Patch<P>,
    ) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
        P: Serialize + Debug,
    {
        let api = self.namespaced_api::<K>(&key.namespace);
        self.bounded("patch status", api.patch_status(&key.name, params, patch))
            .await
    }

    /// Delete one object by key
    pub async fn delete<K>(&self, key: &ObjectKey, params: &DeleteParams) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api = self.namespaced_api::<K>(&key.namespace);
        self.bounded("delete", api.delete(&key.name, params))
            .await
            .map(|_| ())
    }

    /// Delete every object of `K` in a namespace matching the list params
    pub async fn delete_collection<K>(
        &self,
        namespace: &str,
        delete_params: &DeleteParams,
        list_params: &ListParams,
    ) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api = self.namespaced_api::<K>(namespace);
        self.bounded(
            "delete collection",
            api.delete_collection(delete_params, list_params),
        )
        .await
        .map(|_| ())
    }

    /// Publish an event about `reference` through this cluster's recorder
    pub async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: &str,
    ) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let event = EventRecord {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        self.bounded("publish event", recorder.publish(&event, reference))
            .await
    }

    /// Run a client call inside the throttle and exec-timeout envelope.
    pub(crate) async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = kube::Result<T>>,
    {
        let call = async {
            if let Some(bucket) = &self.throttle {
                let wait = bucket.reserve();
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            fut.await
        };
        match tokio::time::timeout(self.options.exec_timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout {
                op,
                after: self.options.exec_timeout,
            }),
        }
    }

    fn api_for<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match obj.meta().namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

async fn health_loop(
    client: Client,
    connected: Arc<AtomicBool>,
    interval: Duration,
    timeout: Duration,
    cluster: String,
    token: CancellationToken,
) {
    // The first probe runs synchronously on loop entry so IsConnected
    // stabilizes quickly after start.
    probe_once(&client, &connected, timeout, &cluster).await;

    if interval < Duration::from_secs(1) {
        warn!(cluster = %cluster, "health check loop disabled, interval must be at least 1s");
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => probe_once(&client, &connected, timeout, &cluster).await,
        }
    }
}

async fn probe_once(client: &Client, connected: &AtomicBool, timeout: Duration, cluster: &str) {
    match healthz(client, timeout).await {
        Ok(ok) => connected.store(ok, Ordering::Release),
        Err(err) => {
            error!(cluster = %cluster, error = %err, "cluster health check failed");
            connected.store(false, Ordering::Release);
        }
    }
}

/// Probe `/healthz`; healthy means the body equals "ok" case-insensitively.
async fn healthz(client: &Client, timeout: Duration) -> Result<bool> {
    if timeout < MIN_EXEC_TIMEOUT {
        return Err(Error::configuration(
            "health request timeout must be at least 100ms",
        ));
    }
    let request = http::Request::get("/healthz")
        .body(Vec::new())
        .map_err(|err| Error::configuration(err.to_string()))?;
    match tokio::time::timeout(timeout, client.request_text(request)).await {
        Ok(Ok(body)) => Ok(body.trim().eq_ignore_ascii_case("ok")),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::Timeout {
            op: "healthz",
            after: timeout,
        }),
    }
}
