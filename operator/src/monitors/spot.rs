//! Spot interruption notice monitor.

use super::{EventChannels, Monitor};
use crate::cloud::MetadataClient;
use crate::util::Error;
use nth_types::{hash_event_id, AckState, EventState, InterruptionEvent, Kind, MonitorKind};
use std::sync::Arc;

pub struct SpotItnMonitor {
    metadata: Arc<dyn MetadataClient>,
    node_name: String,
}

impl SpotItnMonitor {
    pub fn new(metadata: Arc<dyn MetadataClient>, node_name: impl Into<String>) -> Self {
        SpotItnMonitor {
            metadata,
            node_name: node_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl Monitor for SpotItnMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::SpotItnMetadata
    }

    async fn poll(&self, channels: &EventChannels) -> Result<(), Error> {
        let Some(doc) = self.metadata.spot_itn().await? else {
            return Ok(());
        };
        let event_id = hash_event_id(Kind::SpotItn, &self.node_name, &[&doc.action], &doc.time.to_rfc3339());
        channels.route(InterruptionEvent {
            event_id,
            kind: Kind::SpotItn,
            source: self.kind(),
            node_name: self.node_name.clone(),
            instance_id: None,
            provider_id: None,
            instance_type: None,
            autoscaling_group_name: None,
            state: EventState::Active,
            start_time: doc.time,
            end_time: None,
            description: format!("spot instance interruption: {}", doc.action),
            code: None,
            is_managed: true,
            ack: AckState::None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::metadata::{RebalanceDoc, ScheduledEventDoc, SpotItnDoc};
    use tokio::sync::mpsc;

    struct FixedMetadata(Option<SpotItnDoc>);

    #[async_trait::async_trait]
    impl MetadataClient for FixedMetadata {
        async fn spot_itn(&self) -> Result<Option<SpotItnDoc>, Error> {
            Ok(self
                .0
                .as_ref()
                .map(|d| SpotItnDoc { action: d.action.clone(), time: d.time }))
        }
        async fn scheduled_events(&self) -> Result<Vec<ScheduledEventDoc>, Error> {
            Ok(vec![])
        }
        async fn asg_target_state(&self) -> Result<Option<String>, Error> {
            Ok(None)
        }
        async fn rebalance_recommendation(&self) -> Result<Option<RebalanceDoc>, Error> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn happy_path_produces_prefixed_event_id() {
        let time = "2020-10-26T15:15:15Z".parse().unwrap();
        let metadata = Arc::new(FixedMetadata(Some(SpotItnDoc {
            action: "terminate".to_string(),
            time,
        })));
        let monitor = SpotItnMonitor::new(metadata, "node-a");
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, _crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();

        let event = irx.try_recv().unwrap();
        assert!(event.event_id.starts_with("spot-itn-"));
        assert_eq!(event.start_time, time);
    }

    #[tokio::test]
    async fn no_document_produces_no_event() {
        let metadata = Arc::new(FixedMetadata(None));
        let monitor = SpotItnMonitor::new(metadata, "node-a");
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, _crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();
        assert!(irx.try_recv().is_err());
    }
}
