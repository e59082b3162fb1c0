//! Rebalance recommendation monitor.

use super::{EventChannels, Monitor};
use crate::cloud::MetadataClient;
use crate::util::Error;
use nth_types::{hash_event_id, AckState, EventState, InterruptionEvent, Kind, MonitorKind};
use std::sync::Arc;

pub struct RebalanceMonitor {
    metadata: Arc<dyn MetadataClient>,
    node_name: String,
}

impl RebalanceMonitor {
    pub fn new(metadata: Arc<dyn MetadataClient>, node_name: impl Into<String>) -> Self {
        RebalanceMonitor {
            metadata,
            node_name: node_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl Monitor for RebalanceMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::RebalanceMetadata
    }

    async fn poll(&self, channels: &EventChannels) -> Result<(), Error> {
        let Some(doc) = self.metadata.rebalance_recommendation().await? else {
            return Ok(());
        };
        let event_id = hash_event_id(
            Kind::RebalanceRecommendation,
            &self.node_name,
            &[],
            &doc.notice_time.to_rfc3339(),
        );
        channels.route(InterruptionEvent {
            event_id,
            kind: Kind::RebalanceRecommendation,
            source: self.kind(),
            node_name: self.node_name.clone(),
            instance_id: None,
            provider_id: None,
            instance_type: None,
            autoscaling_group_name: None,
            state: EventState::Active,
            start_time: doc.notice_time,
            end_time: None,
            description: "instance is at elevated risk of interruption".to_string(),
            code: None,
            is_managed: true,
            ack: AckState::None,
        });
        Ok(())
    }
}
