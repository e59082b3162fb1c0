//! Kubernetes event recorder: emits `MonitorError`, `CordonError`,
//! `DrainError`, `UncordonError`, `Uncordon` against the affected node.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, node_name: &str, reason: &str, note: String, is_error: bool);
}

pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// Tags every event with a fresh per-process instance ID, so multiple
    /// replicas (or restarts) are distinguishable in `kubectl describe`
    /// output rather than all reporting as the same anonymous controller.
    pub fn new(client: Client) -> Self {
        KubeEventRecorder {
            client,
            reporter: Reporter {
                controller: "node-termination-handler".to_string(),
                instance: Some(uuid::Uuid::new_v4().to_string()),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, node_name: &str, reason: &str, note: String, is_error: bool) {
        let reference = ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(node_name.to_string()),
            ..Default::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let event = Event {
            type_: if is_error { EventType::Warning } else { EventType::Normal },
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event).await {
            eprintln!("failed to publish event {reason} for {node_name}: {e}");
        }
    }
}

pub struct NoopEventRecorder;

#[async_trait]
impl EventRecorder for NoopEventRecorder {
    async fn record(&self, _node_name: &str, _reason: &str, _note: String, _is_error: bool) {}
}
