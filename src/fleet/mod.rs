//! Fleet supervisor: keeps the live cluster clients in step with the
//! configuration source.
//!
//! One reconciliation pass runs on start and on every fetch-interval tick.
//! Clients whose descriptor target is unchanged are kept as the same
//! instance; changed descriptors produce a fresh client and the previous one
//! is stopped after its replacement started; names that disappeared are
//! stopped in detached tasks. A single cluster failing to build or start is
//! logged and skipped, never fatal to the pass.
//!
//! The supervisor is generic over the cluster handle so tests (and unusual
//! embedders) can drive it with mock clusters; production code uses the
//! default [`ClusterClient`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use kube::Resource;
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::{ClusterClient, Options};
use crate::configuration::{ClusterDescriptor, ConfigurationSource};
use crate::handler::EventHandler;
use crate::predicate::Predicate;
use crate::queue::WorkQueue;
use crate::{Error, Result, DEFAULT_FETCH_INTERVAL};

/// The slice of a cluster client the supervisor manages.
///
/// Implemented by [`ClusterClient`]; tests implement it with mocks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterHandle: Send + Sync + 'static {
    /// The descriptor the client was built from
    fn descriptor(&self) -> &ClusterDescriptor;

    /// Run until the token is cancelled; at most once per instance
    async fn start(&self, token: CancellationToken) -> Result<()>;

    /// Cancel the client's internal context; idempotent
    fn stop(&self);

    /// Latest health probe verdict
    fn is_connected(&self) -> bool;

    /// Whether every registered watch finished its initial list
    fn has_synced(&self) -> bool;
}

#[async_trait]
impl ClusterHandle for ClusterClient {
    fn descriptor(&self) -> &ClusterDescriptor {
        ClusterClient::descriptor(self)
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        ClusterClient::start(self, token).await
    }

    fn stop(&self) {
        ClusterClient::stop(self)
    }

    fn is_connected(&self) -> bool {
        ClusterClient::is_connected(self)
    }

    fn has_synced(&self) -> bool {
        ClusterClient::has_synced(self)
    }
}

/// Builds a cluster handle from a descriptor and shared options
pub type BuildClientFn<C> =
    Arc<dyn Fn(ClusterDescriptor, Arc<Options>) -> BoxFuture<'static, Result<Arc<C>>> + Send + Sync>;

/// Hook run once per new cluster client just before it starts.
///
/// The token is the client's lifetime context: subsystems the hook spawns
/// (queues, per-cluster tasks) must tie their lifetime to it.
pub type BeforeStartHook<C> =
    Arc<dyn Fn(CancellationToken, Arc<C>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Observer of cluster add/remove transitions
pub trait ClusterEventListener<C>: Send + Sync {
    /// A client was built, hooked, and started
    fn on_add(&self, cluster: &Arc<C>);
    /// A client is about to be stopped
    fn on_delete(&self, cluster: &Arc<C>);
}

/// Configuration for a [`FleetSupervisor`]
pub struct FleetConfig<C: ClusterHandle = ClusterClient> {
    /// Options handed to every cluster client
    pub options: Options,
    /// Interval between configuration refreshes; zero disables the loop
    pub fetch_interval: Duration,
    /// Source of the desired cluster set
    pub source: Arc<dyn ConfigurationSource>,
    /// Client builder
    pub build: BuildClientFn<C>,
}

impl FleetConfig<ClusterClient> {
    /// Config building real [`ClusterClient`]s with default options
    pub fn new(source: Arc<dyn ConfigurationSource>) -> Self {
        Self::with_builder(
            source,
            Arc::new(|descriptor, options| {
                Box::pin(async move {
                    ClusterClient::new(descriptor, (*options).clone())
                        .await
                        .map(Arc::new)
                })
            }),
        )
    }
}

impl<C: ClusterHandle> FleetConfig<C> {
    /// Config with a custom client builder
    pub fn with_builder(source: Arc<dyn ConfigurationSource>, build: BuildClientFn<C>) -> Self {
        Self {
            options: Options::default(),
            fetch_interval: DEFAULT_FETCH_INTERVAL,
            source,
            build,
        }
    }

    /// Build the supervisor
    pub fn build(self) -> Arc<FleetSupervisor<C>> {
        Arc::new(FleetSupervisor {
            options: Arc::new(self.options),
            fetch_interval: self.fetch_interval,
            source: self.source,
            build: self.build,
            state: tokio::sync::Mutex::new(FleetState {
                clients: HashMap::new(),
                hooks: Vec::new(),
                listeners: Vec::new(),
            }),
            started: AtomicBool::new(false),
            root: std::sync::Mutex::new(None),
        })
    }
}

struct FleetEntry<C> {
    client: Arc<C>,
    token: CancellationToken,
}

impl<C> Clone for FleetEntry<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            token: self.token.clone(),
        }
    }
}

struct FleetState<C> {
    clients: HashMap<String, FleetEntry<C>>,
    hooks: Vec<BeforeStartHook<C>>,
    listeners: Vec<Arc<dyn ClusterEventListener<C>>>,
}

/// Maintains the live `name -> cluster client` map; see the module docs
pub struct FleetSupervisor<C: ClusterHandle = ClusterClient> {
    options: Arc<Options>,
    fetch_interval: Duration,
    source: Arc<dyn ConfigurationSource>,
    build: BuildClientFn<C>,
    // One mutex serializes reconciliation passes and map snapshots.
    state: tokio::sync::Mutex<FleetState<C>>,
    started: AtomicBool,
    root: std::sync::Mutex<Option<CancellationToken>>,
}

impl<C: ClusterHandle> FleetSupervisor<C> {
    /// Run the supervisor until `token` is cancelled: one reconciliation
    /// pass now, then one per fetch interval.
    ///
    /// At most once per instance. An error from the first pass is returned;
    /// later pass failures are logged and retried on the next tick.
    /// Cancellation is the normal exit path, and every cluster client's
    /// context is a child of `token`.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyStarted("fleet supervisor".to_string()));
        }
        *self.root.lock().expect("root mutex poisoned") = Some(token.clone());

        self.fetch_once().await?;

        if !self.fetch_interval.is_zero() {
            let supervisor = self.clone();
            let loop_token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(supervisor.fetch_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = loop_token.cancelled() => return,
                        _ = ticker.tick() => {
                            if let Err(err) = supervisor.fetch_once().await {
                                error!(error = %err, "fleet configuration refresh failed");
                            }
                        }
                    }
                }
            });
        }

        token.cancelled().await;
        info!("fleet supervisor stopped");
        Ok(())
    }

    /// Run one reconciliation pass against the configuration source.
    ///
    /// Invoked automatically by the refresh loop; exposed for embedders that
    /// want to trigger a pass on an external signal.
    pub async fn fetch_once(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            warn!("fleet supervisor not started, skipping reconciliation");
            return Ok(());
        }
        let Some(root) = self.root.lock().expect("root mutex poisoned").clone() else {
            return Ok(());
        };

        let mut state = self.state.lock().await;
        let desired = self.source.get_all().await.map_err(|err| {
            Error::configuration(format!("get all cluster configurations failed: {err}"))
        })?;

        let mut fresh: HashMap<String, FleetEntry<C>> = HashMap::with_capacity(desired.len());
        let mut change = 0usize;

        for descriptor in desired {
            let name = descriptor.name.clone();
            let existing = state.clients.get(&name).cloned();

            if let Some(current) = &existing {
                if current.client.descriptor().same_target(&descriptor) {
                    fresh.insert(name, current.clone());
                    continue;
                }
            }

            let entry = match self
                .launch_cluster(descriptor, &state.hooks, &state.listeners, &root)
                .await
            {
                Ok(entry) => entry,
                Err(err) => {
                    // One broken cluster never takes down its peers.
                    warn!(cluster = %name, error = %err, "building cluster client failed, skipping");
                    continue;
                }
            };

            if let Some(previous) = existing {
                info!(cluster = %name, "configuration modified, stopping previous cluster client");
                stop_entry(&state.listeners, previous);
            }

            info!(cluster = %name, "cluster client added");
            fresh.insert(name, entry);
            change += 1;
        }

        for (name, entry) in &state.clients {
            if fresh.contains_key(name) {
                continue;
            }
            change += 1;
            let listeners = state.listeners.clone();
            let entry = entry.clone();
            let name = name.clone();
            tokio::spawn(async move {
                info!(cluster = %name, "stopping removed cluster client");
                stop_entry(&listeners, entry);
            });
        }

        if change > 0 {
            state.clients = fresh;
        }
        Ok(())
    }

    async fn launch_cluster(
        &self,
        descriptor: ClusterDescriptor,
        hooks: &[BeforeStartHook<C>],
        listeners: &[Arc<dyn ClusterEventListener<C>>],
        root: &CancellationToken,
    ) -> Result<FleetEntry<C>> {
        let name = descriptor.name.clone();
        let client = (self.build)(descriptor, self.options.clone()).await?;

        let token = root.child_token();
        for hook in hooks {
            if let Err(err) = hook(token.clone(), client.clone()).await {
                client.stop();
                token.cancel();
                return Err(Error::configuration(format!(
                    "before-start hook for cluster {name} failed: {err}"
                )));
            }
        }

        {
            let client = client.clone();
            let token = token.clone();
            let name = name.clone();
            tokio::spawn(async move {
                if let Err(err) = client.start(token).await {
                    error!(cluster = %name, error = %err, "cluster client exited with error");
                }
            });
        }

        for listener in listeners {
            listener.on_add(&client);
        }

        Ok(FleetEntry { client, token })
    }

    /// The client registered under `name`
    pub async fn get_with_name(&self, name: &str) -> Result<Arc<C>> {
        let state = self.state.lock().await;
        state
            .clients
            .get(name)
            .map(|entry| entry.client.clone())
            .ok_or_else(|| Error::ClusterNotFound(name.to_string()))
    }

    /// The client registered under `name`, if its health probe reports
    /// connected
    pub async fn get_connected_with_name(&self, name: &str) -> Result<Arc<C>> {
        let state = self.state.lock().await;
        match state.clients.get(name) {
            Some(entry) if entry.client.is_connected() => Ok(entry.client.clone()),
            Some(_) => Err(Error::ClusterDisconnected(name.to_string())),
            None => Err(Error::ClusterNotFound(name.to_string())),
        }
    }

    /// Snapshot of every live client
    pub async fn get_all(&self) -> Vec<Arc<C>> {
        let state = self.state.lock().await;
        state
            .clients
            .values()
            .map(|entry| entry.client.clone())
            .collect()
    }

    /// Snapshot of every live client whose health probe reports connected
    pub async fn get_all_connected(&self) -> Vec<Arc<C>> {
        let state = self.state.lock().await;
        state
            .clients
            .values()
            .filter(|entry| entry.client.is_connected())
            .map(|entry| entry.client.clone())
            .collect()
    }

    /// True once started and every live client reports synced
    pub async fn has_synced(&self) -> bool {
        if !self.started.load(Ordering::Acquire) {
            warn!("fleet supervisor not started, has_synced is false");
            return false;
        }
        let state = self.state.lock().await;
        state.clients.values().all(|entry| entry.client.has_synced())
    }

    /// Register a hook run for every cluster client built after this call.
    ///
    /// Clients that are already live are not revisited; register hooks
    /// before `start` to cover the whole fleet.
    pub async fn register_before_start_hook(&self, hook: BeforeStartHook<C>) {
        let mut state = self.state.lock().await;
        state.hooks.push(hook);
    }

    /// Register a listener for cluster add/remove transitions.
    ///
    /// The listener immediately observes an `on_add` for every currently
    /// live client, so late registrants see a consistent state.
    pub async fn add_cluster_event_listener(&self, listener: Arc<dyn ClusterEventListener<C>>) {
        let mut state = self.state.lock().await;
        for entry in state.clients.values() {
            listener.on_add(&entry.client);
        }
        state.listeners.push(listener);
    }
}

fn stop_entry<C: ClusterHandle>(
    listeners: &[Arc<dyn ClusterEventListener<C>>],
    entry: FleetEntry<C>,
) {
    for listener in listeners {
        listener.on_delete(&entry.client);
    }
    entry.client.stop();
    entry.token.cancel();
}

impl FleetSupervisor<ClusterClient> {
    /// Watch `K` on every cluster built after this call.
    ///
    /// Installs a before-start hook that registers the watch on each new
    /// client; events from all clusters funnel into the same queue.
    pub async fn watch_all<K>(
        &self,
        queue: Arc<WorkQueue>,
        handler: Arc<dyn EventHandler<K>>,
        predicates: Vec<Arc<dyn Predicate<K>>>,
    ) where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        self.register_before_start_hook(Arc::new(move |_token, client: Arc<ClusterClient>| {
            let queue = queue.clone();
            let handler = handler.clone();
            let predicates = predicates.clone();
            Box::pin(async move { client.watch(queue, handler, predicates) })
        }))
        .await;
    }

    /// Register a cache-only watch for `K` on every cluster built after
    /// this call; see [`ClusterClient::sync`].
    pub async fn sync_all<K>(&self)
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        self.register_before_start_hook(Arc::new(move |_token, client: Arc<ClusterClient>| {
            Box::pin(async move { client.sync::<K>() })
        }))
        .await;
    }
}
