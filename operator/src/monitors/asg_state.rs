//! ASG target-lifecycle-state monitor.

use super::{EventChannels, Monitor};
use crate::cloud::MetadataClient;
use crate::util::Error;
use chrono::Utc;
use nth_types::{hash_event_id, AckState, EventState, InterruptionEvent, Kind, MonitorKind};
use std::sync::Arc;

pub struct AsgTargetStateMonitor {
    metadata: Arc<dyn MetadataClient>,
    node_name: String,
}

impl AsgTargetStateMonitor {
    pub fn new(metadata: Arc<dyn MetadataClient>, node_name: impl Into<String>) -> Self {
        AsgTargetStateMonitor {
            metadata,
            node_name: node_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl Monitor for AsgTargetStateMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::AsgTargetStateMetadata
    }

    async fn poll(&self, channels: &EventChannels) -> Result<(), Error> {
        let Some(state) = self.metadata.asg_target_state().await? else {
            return Ok(());
        };
        if state != "Terminated" {
            return Ok(());
        }
        let now = Utc::now();
        let event_id = hash_event_id(Kind::AsgLifecycleTerminate, &self.node_name, &[&state], &now.to_rfc3339());
        channels.route(InterruptionEvent {
            event_id,
            kind: Kind::AsgLifecycleTerminate,
            source: self.kind(),
            node_name: self.node_name.clone(),
            instance_id: None,
            provider_id: None,
            instance_type: None,
            autoscaling_group_name: None,
            state: EventState::Active,
            start_time: now,
            end_time: None,
            description: "ASG target lifecycle state is Terminated".to_string(),
            code: None,
            is_managed: true,
            ack: AckState::None,
        });
        Ok(())
    }
}
