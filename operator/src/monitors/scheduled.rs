//! Scheduled-maintenance monitor.

use super::{EventChannels, Monitor};
use crate::cloud::MetadataClient;
use crate::util::Error;
use nth_types::{hash_event_id, AckState, EventState, InterruptionEvent, Kind, MonitorKind};
use std::sync::Arc;

pub struct ScheduledMonitor {
    metadata: Arc<dyn MetadataClient>,
    node_name: String,
}

impl ScheduledMonitor {
    pub fn new(metadata: Arc<dyn MetadataClient>, node_name: impl Into<String>) -> Self {
        ScheduledMonitor {
            metadata,
            node_name: node_name.into(),
        }
    }
}

fn map_state(raw: &str) -> EventState {
    match raw {
        "canceled" | "cancelled" => EventState::Canceled,
        "completed" => EventState::Completed,
        _ => EventState::Active,
    }
}

#[async_trait::async_trait]
impl Monitor for ScheduledMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::ScheduledMetadata
    }

    async fn poll(&self, channels: &EventChannels) -> Result<(), Error> {
        for doc in self.metadata.scheduled_events().await? {
            let start_time = doc.not_before()?;
            let end_time = Some(doc.not_after());
            let event_id = if doc.event_id.is_empty() {
                hash_event_id(Kind::ScheduledEvent, &self.node_name, &[&doc.code], &start_time.to_rfc3339())
            } else {
                doc.event_id.clone()
            };
            channels.route(InterruptionEvent {
                event_id,
                kind: Kind::ScheduledEvent,
                source: self.kind(),
                node_name: self.node_name.clone(),
                instance_id: None,
                provider_id: None,
                instance_type: None,
                autoscaling_group_name: None,
                state: map_state(&doc.state),
                start_time,
                end_time,
                description: doc.description,
                code: Some(doc.code),
                is_managed: true,
                ack: AckState::None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::metadata::{RebalanceDoc, ScheduledEventDoc, SpotItnDoc};
    use tokio::sync::mpsc;

    struct FixedMetadata(Vec<ScheduledEventDoc>);

    #[async_trait::async_trait]
    impl MetadataClient for FixedMetadata {
        async fn spot_itn(&self) -> Result<Option<SpotItnDoc>, Error> {
            Ok(None)
        }
        async fn scheduled_events(&self) -> Result<Vec<ScheduledEventDoc>, Error> {
            Ok(self
                .0
                .iter()
                .map(|d| ScheduledEventDoc {
                    code: d.code.clone(),
                    description: d.description.clone(),
                    event_id: d.event_id.clone(),
                    not_before: d.not_before.clone(),
                    not_after: d.not_after.clone(),
                    state: d.state.clone(),
                })
                .collect())
        }
        async fn asg_target_state(&self) -> Result<Option<String>, Error> {
            Ok(None)
        }
        async fn rebalance_recommendation(&self) -> Result<Option<RebalanceDoc>, Error> {
            Ok(None)
        }
    }

    fn doc(state: &str) -> ScheduledEventDoc {
        ScheduledEventDoc {
            code: "system-reboot".to_string(),
            description: "reboot".to_string(),
            event_id: "evt-1".to_string(),
            not_before: "21 Jan 2019 09:00:43 GMT".to_string(),
            not_after: None,
            state: state.to_string(),
        }
    }

    #[tokio::test]
    async fn active_event_routes_to_interrupt_channel() {
        let metadata = Arc::new(FixedMetadata(vec![doc("active")]));
        let monitor = ScheduledMonitor::new(metadata, "node-a");
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, mut crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();
        assert_eq!(irx.try_recv().unwrap().event_id, "evt-1");
        assert!(crx.try_recv().is_err());
    }

    #[tokio::test]
    async fn canceled_event_routes_to_cancel_channel() {
        let metadata = Arc::new(FixedMetadata(vec![doc("canceled")]));
        let monitor = ScheduledMonitor::new(metadata, "node-a");
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, mut crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();
        assert!(irx.try_recv().is_err());
        assert_eq!(crx.try_recv().unwrap().event_id, "evt-1");
    }
}
