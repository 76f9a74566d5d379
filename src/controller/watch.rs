//! Cluster snapshot backed by kube-runtime reflectors
//!
//! Ingresses, Services, Nodes and the scheme allowlist ConfigMap are cached
//! in reflector stores. Any watch event wakes the driver, which coalesces
//! bursts of events into a single convergence pass.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::alb::AlbController;
use super::traits::EventSource;
use crate::error::{Error, Result};
use crate::ingress::annotations::INTERNET_FACING_ALLOWLIST;

pub struct KubeEventSource {
    ingresses: Store<Ingress>,
    services: Store<Service>,
    nodes: Store<Node>,
    config_maps: Store<ConfigMap>,
}

/// Reflector tasks feeding a [`KubeEventSource`]
pub struct Watches {
    pub source: Arc<KubeEventSource>,
    pub trigger: Arc<Notify>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl KubeEventSource {
    /// Start one reflector per watched kind
    pub fn spawn(client: Client, allowlist_namespace: &str) -> Watches {
        let trigger = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        let (ingresses, task) = reflect(
            Api::<Ingress>::all(client.clone()),
            watcher::Config::default(),
            trigger.clone(),
        );
        tasks.push(task);
        let (services, task) = reflect(
            Api::<Service>::all(client.clone()),
            watcher::Config::default(),
            trigger.clone(),
        );
        tasks.push(task);
        let (nodes, task) = reflect(
            Api::<Node>::all(client.clone()),
            watcher::Config::default(),
            trigger.clone(),
        );
        tasks.push(task);
        let (config_maps, task) = reflect(
            Api::<ConfigMap>::namespaced(client, allowlist_namespace),
            watcher::Config::default()
                .fields(&format!("metadata.name={INTERNET_FACING_ALLOWLIST}")),
            trigger.clone(),
        );
        tasks.push(task);

        Watches {
            source: Arc::new(Self {
                ingresses,
                services,
                nodes,
                config_maps,
            }),
            trigger,
            tasks,
        }
    }

    /// Wait until every store has completed its initial list
    pub async fn wait_until_ready(&self) -> Result<()> {
        let not_ready =
            |kind: &str| Error::ConfigError(format!("{kind} reflector stopped before syncing"));
        self.ingresses
            .wait_until_ready()
            .await
            .map_err(|_| not_ready("Ingress"))?;
        self.services
            .wait_until_ready()
            .await
            .map_err(|_| not_ready("Service"))?;
        self.nodes
            .wait_until_ready()
            .await
            .map_err(|_| not_ready("Node"))?;
        self.config_maps
            .wait_until_ready()
            .await
            .map_err(|_| not_ready("ConfigMap"))?;
        info!("Cluster caches synced");
        Ok(())
    }
}

impl EventSource for KubeEventSource {
    fn ingresses(&self) -> Vec<Arc<Ingress>> {
        self.ingresses.state()
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }

    fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.state()
    }

    fn config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        self.config_maps.get(&ObjectRef::new(name).within(namespace))
    }
}

fn reflect<K>(
    api: Api<K>,
    config: watcher::Config,
    trigger: Arc<Notify>,
) -> (Store<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let kind = K::kind(&K::DynamicType::default()).to_string();

    let task = tokio::spawn(async move {
        let stream = reflector::reflector(writer, watcher(api, config)).default_backoff();
        tokio::pin!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(_) => trigger.notify_one(),
                Err(e) => warn!("{} watch error: {}", kind, e),
            }
        }
        error!("{} watch stream ended", kind);
    });
    (reader, task)
}

/// Run a convergence pass for every wake-up
pub async fn run_event_driver(controller: Arc<AlbController>, trigger: Arc<Notify>) {
    loop {
        trigger.notified().await;
        debug!("Cluster change observed");
        controller.on_update().await;
    }
}

/// Bring ingress statuses in line with the registry after every committed
/// pass, event-driven or forced
pub async fn run_status_publisher(
    controller: Arc<AlbController>,
    source: Arc<KubeEventSource>,
    client: Client,
) {
    let mut passes = controller.subscribe_passes();
    while passes.changed().await.is_ok() {
        publish_statuses(&controller, &source, &client).await;
    }
}

async fn publish_statuses(controller: &AlbController, source: &KubeEventSource, client: &Client) {
    for (id, wanted) in controller.pending_statuses(&source.ingresses()).await {
        let api: Api<Ingress> = Api::namespaced(client.clone(), &id.namespace);
        let patch = json!({ "status": { "loadBalancer": { "ingress": wanted } } });
        match api
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!("Updated status of {} to {:?}", id, wanted),
            Err(e) => warn!("Failed to update status of {}: {}", id, e),
        }
    }
}
