//! In-memory collaborators and fixtures shared by the unit tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, NodeSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::api::ObjectMeta;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, Semaphore};

use super::alb::{AlbController, Collaborators};
use super::config::{ControllerArgs, ControllerConfig};
use super::health::HealthMonitor;
use super::traits::{DiscoveryScope, EventRecorder, EventSource, EventType, ResourceReconciler};
use crate::error::{Error, Result};
use crate::ingress::builder::{CLUSTER_TAG_PREFIX, INGRESS_NAME_TAG, NAMESPACE_TAG};
use crate::ingress::{
    DefaultAnnotationInterpreter, DesiredSpec, ExternalHandle, ListenerSpec, ManagedResource,
    Protocol, ResourceId, Scheme,
};
use crate::provider::DryRunProvider;

#[derive(Default)]
pub struct StaticSource {
    ingresses: RwLock<BTreeMap<ResourceId, Arc<Ingress>>>,
    services: RwLock<BTreeMap<(String, String), Arc<Service>>>,
    nodes: RwLock<Vec<Arc<Node>>>,
    config_maps: RwLock<BTreeMap<(String, String), Arc<ConfigMap>>>,
}

fn key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        meta.name.clone().unwrap_or_default(),
    )
}

impl StaticSource {
    pub fn add_ingress(&self, ingress: Ingress) {
        let (namespace, name) = key(&ingress.metadata);
        self.ingresses
            .write()
            .insert(ResourceId::new(namespace, name), Arc::new(ingress));
    }

    pub fn remove_ingress(&self, namespace: &str, name: &str) {
        self.ingresses
            .write()
            .remove(&ResourceId::new(namespace, name));
    }

    pub fn add_service(&self, service: Service) {
        self.services
            .write()
            .insert(key(&service.metadata), Arc::new(service));
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.services
            .write()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn add_node(&self, node: Arc<Node>) {
        self.nodes.write().push(node);
    }

    pub fn set_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        self.config_maps.write().insert(
            (namespace.to_string(), name.to_string()),
            Arc::new(config_map),
        );
    }

    /// Ingress `name` backed by NodePort service `name` on port 80
    pub fn serve(&self, namespace: &str, name: &str) {
        self.add_service(nodeport_service(namespace, name, 80, 30080));
        self.add_ingress(ingress(namespace, name, name, 80));
    }
}

impl EventSource for StaticSource {
    fn ingresses(&self) -> Vec<Arc<Ingress>> {
        self.ingresses.read().values().cloned().collect()
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    fn config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        self.config_maps
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

pub fn ingress(namespace: &str, name: &str, service: &str, port: i32) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(format!("{name}.example.com")),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn node(name: &str, provider_id: &str, labels: &[(&str, &str)]) -> Arc<Node> {
    Arc::new(Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(provider_id.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn nodeport_service(namespace: &str, name: &str, port: i32, node_port: i32) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                node_port: Some(node_port),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn spec_for(namespace: &str, name: &str, load_balancer_name: &str) -> DesiredSpec {
    DesiredSpec {
        load_balancer_name: load_balancer_name.to_string(),
        scheme: Scheme::Internal,
        subnets: vec!["subnet-1".to_string()],
        security_groups: Vec::new(),
        listeners: vec![ListenerSpec {
            port: 80,
            protocol: Protocol::Http,
            certificate_arn: None,
            ssl_policy: None,
        }],
        target_groups: Vec::new(),
        rules: Vec::new(),
        targets: vec!["i-1".to_string()],
        web_acl_id: None,
        tags: BTreeMap::from([
            (format!("{CLUSTER_TAG_PREFIX}prod"), "owned".to_string()),
            (NAMESPACE_TAG.to_string(), namespace.to_string()),
            (INGRESS_NAME_TAG.to_string(), name.to_string()),
        ]),
    }
}

/// Spec for ingress `default/<suffix>` where `load_balancer_name` is
/// `<prefix>-<suffix>`
pub fn desired_spec(load_balancer_name: &str) -> DesiredSpec {
    let name = load_balancer_name
        .split_once('-')
        .map_or(load_balancer_name, |(_, rest)| rest);
    spec_for("default", name, load_balancer_name)
}

/// A provisioned resource with a live handle
pub fn live(namespace: &str, name: &str) -> ManagedResource {
    let load_balancer_name = format!("prod-{name}");
    ManagedResource {
        id: ResourceId::new(namespace, name),
        desired: Some(spec_for(namespace, name, &load_balancer_name)),
        handle: Some(ExternalHandle {
            arn: format!(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:loadbalancer/app/{load_balancer_name}/0"
            ),
            dns_name: Some(format!("{load_balancer_name}.us-east-1.elb.amazonaws.com")),
            deleted: false,
        }),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub id: ResourceId,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }

    pub fn reasons_for(&self, id: &ResourceId) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| &e.id == id)
            .map(|e| e.reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn publish(&self, id: &ResourceId, type_: EventType, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            id: id.clone(),
            type_,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Injected misbehaviour for one resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Fail,
    /// Fails with an error that retrying cannot fix
    Invalid,
    Hang,
    Panic,
}

/// [`DryRunProvider`] with per-resource faults, call counting and an
/// optional gate that holds reconciliations until released
pub struct ScriptedReconciler {
    pub provider: DryRunProvider,
    faults: Mutex<BTreeMap<ResourceId, Fault>>,
    calls: Mutex<Vec<ResourceId>>,
    fail_discovery: AtomicBool,
    gate: Mutex<Option<(Arc<Notify>, Arc<Semaphore>)>>,
}

impl Default for ScriptedReconciler {
    fn default() -> Self {
        Self {
            provider: DryRunProvider::new("us-east-1"),
            faults: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_discovery: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }
}

impl ScriptedReconciler {
    pub fn set_fault(&self, id: &ResourceId, fault: Fault) {
        self.faults.lock().insert(id.clone(), fault);
    }

    pub fn clear_fault(&self, id: &ResourceId) {
        self.faults.lock().remove(id);
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::SeqCst);
    }

    /// Returns `(entered, release)`: every reconciliation signals `entered`
    /// and then waits for a `release` permit
    pub fn hold(&self) -> (Arc<Notify>, Arc<Semaphore>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Semaphore::new(0)));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<ResourceId> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, id: &ResourceId) -> usize {
        self.calls.lock().iter().filter(|c| *c == id).count()
    }
}

#[async_trait]
impl ResourceReconciler for ScriptedReconciler {
    async fn reconcile(
        &self,
        resource: &mut ManagedResource,
        events: &dyn EventRecorder,
    ) -> Result<()> {
        self.calls.lock().push(resource.id.clone());

        let gate = self.gate.lock().clone();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            let _open = release.acquire().await.unwrap();
        }

        let fault = self.faults.lock().get(&resource.id).copied();
        match fault {
            Some(Fault::Fail) => Err(Error::ReconcileError {
                id: resource.id.clone(),
                message: "injected failure".to_string(),
            }),
            Some(Fault::Invalid) => Err(Error::AnnotationError {
                key: "alb.ingress.kubernetes.io/certificate-arn".to_string(),
                message: "injected invalid value".to_string(),
            }),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Fault::Panic) => panic!("injected panic for {}", resource.id),
            None => self.provider.reconcile(resource, events).await,
        }
    }

    async fn discover(&self, scope: &DiscoveryScope) -> Result<Vec<ManagedResource>> {
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(Error::ProviderError("inventory unavailable".to_string()));
        }
        self.provider.discover(scope).await
    }
}

pub fn config() -> ControllerConfig {
    ControllerArgs {
        cluster_name: "prod".to_string(),
        alb_name_prefix: Some("prod".to_string()),
        ..ControllerArgs::default()
    }
    .validate()
    .unwrap()
}

/// A controller wired to in-memory collaborators
pub struct Harness {
    pub source: Arc<StaticSource>,
    pub reconciler: Arc<ScriptedReconciler>,
    pub events: Arc<RecordingEvents>,
    pub controller: Arc<AlbController>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(config(), HealthMonitor::new())
    }

    pub fn with(config: ControllerConfig, health: HealthMonitor) -> Self {
        let source = Arc::new(StaticSource::default());
        let reconciler = Arc::new(ScriptedReconciler::default());
        let events = Arc::new(RecordingEvents::default());
        let interpreter = Arc::new(DefaultAnnotationInterpreter::new(config.restriction.clone()));

        let controller = Arc::new(AlbController::new(
            config,
            Collaborators {
                source: source.clone(),
                reconciler: reconciler.clone(),
                interpreter,
                events: events.clone(),
                health,
            },
        ));
        Self {
            source,
            reconciler,
            events,
            controller,
        }
    }
}
