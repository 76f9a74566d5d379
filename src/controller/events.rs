//! Kubernetes Event publishing for managed ingresses

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource as EventReporter, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, warn};

use super::traits::{EventRecorder, EventType};
use crate::ingress::ResourceId;

pub const COMPONENT: &str = "alb-ingress-controller";

/// Creates `core/v1` Events whose involved object is the ingress
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn ingress_reference(id: &ResourceId) -> ObjectReference {
    ObjectReference {
        api_version: Some("networking.k8s.io/v1".to_string()),
        kind: Some("Ingress".to_string()),
        namespace: Some(id.namespace.clone()),
        name: Some(id.name.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, id: &ResourceId, type_: EventType, reason: &str, message: &str) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &id.namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-event-", id.name)),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: ingress_reference(id),
            source: Some(EventReporter {
                component: Some(COMPONENT.to_string()),
                host: None,
            }),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        match events.create(&PostParams::default(), &event).await {
            Ok(_) => debug!("Published {} event {} for {}", type_, reason, id),
            Err(e) => warn!("Failed to publish {} event for {}: {:?}", reason, id, e),
        }
    }
}
