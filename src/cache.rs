// System
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

// Third Party
use async_trait::async_trait;
use futures::{pin_mut, Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::Api,
    runtime::{
        reflector::{self, store::Writer, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Local
use crate::error::{Error, Result};

/// The labels of a node as last seen by the watch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        Self {
            name: node.name_any(),
            labels: node.labels().clone(),
        }
    }
}

/// Identity of a pod within the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

/// A pod as last seen by the watch. `node_name` is empty while the pod is unscheduled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
}

impl PodSnapshot {
    pub fn key(&self) -> PodKey {
        PodKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl From<&Pod> for PodSnapshot {
    fn from(pod: &Pod) -> Self {
        Self {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.clone())
                .unwrap_or_default(),
            labels: pod.labels().clone(),
        }
    }
}

/// Whether a kind's reflector holds a complete listing. Set by the first relist, cleared when
/// the watch feeding it ends.
#[derive(Clone)]
struct SyncState {
    kind: &'static str,
    synced: Arc<watch::Sender<bool>>,
}

impl SyncState {
    fn new(kind: &'static str) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            kind,
            synced: Arc::new(synced),
        }
    }

    fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    async fn wait(&self) {
        self.synced.subscribe().wait_for(|synced| *synced).await.ok();
    }

    fn observe<K>(&self, event: &Event<K>) {
        if let Event::Restarted(objects) = event {
            debug!("Relisted {} {}", objects.len(), self.kind);
            if !self.synced.send_replace(true) {
                info!("Initial {} listing complete", self.kind);
            }
        }
    }

    fn lost(&self) {
        if self.synced.send_replace(false) {
            error!(
                "Watch for {} is gone, the cache no longer tracks the cluster",
                self.kind
            );
        }
    }
}

/// A reflector store for one resource kind. The writer stays here until a watch takes it over.
struct Mirror<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    sync: SyncState,
}

impl<K> Mirror<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn new(kind: &'static str) -> Self {
        let (store, writer) = reflector::store();
        Self {
            store,
            writer: Mutex::new(Some(writer)),
            sync: SyncState::new(kind),
        }
    }

    fn apply(&self, event: Event<K>) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::CachePoisoned(self.sync.kind))?;
        let writer = writer
            .as_mut()
            .ok_or(Error::WatchActive(self.sync.kind))?;
        writer.apply_watcher_event(&event);
        self.sync.observe(&event);
        Ok(())
    }

    fn list<S>(&self) -> Result<Vec<S>>
    where
        S: for<'a> From<&'a K>,
    {
        if !self.sync.is_synced() {
            return Err(Error::CacheNotReady);
        }
        Ok(self
            .store
            .state()
            .iter()
            .map(|object| S::from(object.as_ref()))
            .collect())
    }

    /// Hand the writer to a watch task on `api`. Returns `None` if a watch already owns it.
    fn watch(&self, api: Api<K>, token: CancellationToken) -> Result<Option<JoinHandle<()>>> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| Error::CachePoisoned(self.sync.kind))?
            .take();
        Ok(writer.map(|writer| {
            info!("Starting {} watcher...", self.sync.kind);
            let events = watcher::watcher(api, watcher::Config::default()).default_backoff();
            tokio::spawn(follow(writer, events, self.sync.clone(), token))
        }))
    }
}

/// Running watch tasks for the cache. Dropping this without calling [`Subscription::release`]
/// leaves the tasks running until the parent token is cancelled.
#[derive(Default)]
pub struct Subscription {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(token: CancellationToken, handles: Vec<JoinHandle<()>>) -> Self {
        Self { token, handles }
    }

    /// Stop the watches and wait for their tasks to finish.
    pub async fn release(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!("Watch task did not shut down cleanly: {}", error);
            }
        }
    }
}

/// Read access to the cluster view used by the controller.
#[async_trait]
pub trait ClusterState: Send + Sync + 'static {
    /// Start feeding the view. Watches stop once `token` is cancelled.
    fn subscribe(&self, token: CancellationToken) -> Subscription;

    fn is_ready(&self) -> bool;

    /// Resolve once the initial listing of every watched kind has completed.
    async fn wait_until_ready(&self);

    fn list_nodes(&self) -> Result<Vec<NodeSnapshot>>;

    fn list_pods(&self) -> Result<Vec<PodSnapshot>>;
}

/// Watch-driven in-memory mirror of all nodes and pods in the cluster, backed by one reflector
/// store per kind.
pub struct ClusterCache {
    client: Option<Client>,
    nodes: Mirror<Node>,
    pods: Mirror<Pod>,
}

impl ClusterCache {
    pub fn new(client: &Client) -> Self {
        Self {
            client: Some(client.clone()),
            ..Self::offline()
        }
    }

    /// A cache with no cluster connection. It only changes through `apply_*_event`.
    pub fn offline() -> Self {
        Self {
            client: None,
            nodes: Mirror::new("nodes"),
            pods: Mirror::new("pods"),
        }
    }

    pub fn apply_node_event(&self, event: Event<Node>) -> Result<()> {
        self.nodes.apply(event)
    }

    pub fn apply_pod_event(&self, event: Event<Pod>) -> Result<()> {
        self.pods.apply(event)
    }
}

#[async_trait]
impl ClusterState for ClusterCache {
    fn subscribe(&self, token: CancellationToken) -> Subscription {
        let Some(client) = self.client.clone() else {
            debug!("Cluster cache is offline, no watches to start");
            return Subscription::new(token, Vec::new());
        };

        let started = [
            self.nodes.watch(Api::all(client.clone()), token.clone()),
            self.pods.watch(Api::all(client), token.clone()),
        ];
        let mut handles = Vec::new();
        for result in started {
            match result {
                Ok(Some(handle)) => handles.push(handle),
                Ok(None) => warn!("Cluster cache is already subscribed"),
                Err(error) => error!("Could not start watch: {}", error),
            }
        }
        Subscription::new(token, handles)
    }

    fn is_ready(&self) -> bool {
        self.nodes.sync.is_synced() && self.pods.sync.is_synced()
    }

    async fn wait_until_ready(&self) {
        self.nodes.sync.wait().await;
        self.pods.sync.wait().await;
    }

    fn list_nodes(&self) -> Result<Vec<NodeSnapshot>> {
        if !self.is_ready() {
            return Err(Error::CacheNotReady);
        }
        self.nodes.list()
    }

    fn list_pods(&self) -> Result<Vec<PodSnapshot>> {
        if !self.is_ready() {
            return Err(Error::CacheNotReady);
        }
        self.pods.list()
    }
}

/// Feed `events` through the reflector into `writer` until `token` is cancelled.
/// Stream errors are retried by the watcher's backoff. If the stream ends the kind is marked
/// not synced, so passes stop instead of reading frozen state.
async fn follow<K, W>(writer: Writer<K>, events: W, sync: SyncState, token: CancellationToken)
where
    K: Resource<DynamicType = ()> + Clone + 'static,
    W: Stream<Item = watcher::Result<Event<K>>>,
{
    let stream = reflector::reflector(writer, events);
    pin_mut!(stream);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Releasing {} watch", sync.kind);
                break;
            }
            next = stream.next() => match next {
                Some(Ok(event)) => sync.observe(&event),
                Some(Err(error)) => warn!("Watch on {} failed, retrying: {}", sync.kind, error),
                None => {
                    sync.lost();
                    break;
                }
            }
        }
    }
}
