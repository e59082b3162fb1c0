//! Pull-queue monitor: the operator-scoped, single-instance monitor that
//! parses an EventBridge-like envelope and dispatches by
//! `(source, detail-type)`.

use super::{EventChannels, Monitor};
use crate::cloud::ec2::InstanceInfo;
use crate::cloud::{AsgClient, Ec2Client, QueueClient};
use crate::util::Error;
use chrono::{DateTime, Utc};
use nth_types::{AckState, EventState, InterruptionEvent, Kind, MonitorKind};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const STATE_CHANGE_TERMINAL_STATES: &[&str] = &["stopping", "stopped", "shutting-down", "terminated"];

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    source: String,
    #[serde(rename = "detail-type")]
    detail_type: String,
    time: Option<DateTime<Utc>>,
    detail: Value,
}

pub struct QueueMonitor {
    queue: Arc<dyn QueueClient>,
    ec2: Arc<dyn Ec2Client>,
    asg: Arc<dyn AsgClient>,
    managed_tag: Option<String>,
}

impl QueueMonitor {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        ec2: Arc<dyn Ec2Client>,
        asg: Arc<dyn AsgClient>,
        managed_tag: Option<String>,
    ) -> Self {
        QueueMonitor { queue, ec2, asg, managed_tag }
    }

    async fn is_managed(&self, instance: &InstanceInfo) -> Result<bool, Error> {
        let Some(tag) = &self.managed_tag else {
            return Ok(true);
        };
        if instance.tags.contains_key(tag) {
            return Ok(true);
        }
        if let Some(asg_name) = self.asg.describe_autoscaling_group_for_instance(&instance.instance_id).await? {
            let asg_tags = self.ec2.describe_tags(&asg_name).await.unwrap_or_default();
            return Ok(asg_tags.contains_key(tag));
        }
        Ok(false)
    }

    async fn resolve_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, Error> {
        self.ec2.describe_instance(instance_id).await
    }
}

#[async_trait::async_trait]
impl Monitor for QueueMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Queue
    }

    async fn poll(&self, channels: &EventChannels) -> Result<(), Error> {
        for message in self.queue.receive().await? {
            self.handle_message(channels, &message).await?;
        }
        Ok(())
    }
}

impl QueueMonitor {
    async fn handle_message(&self, channels: &EventChannels, message: &crate::cloud::queue::QueueMessage) -> Result<(), Error> {
        let envelope: Envelope = match serde_json::from_str(&message.body) {
            Ok(e) => e,
            Err(_) => {
                // Terminal-for-message: malformed payload. Ack and drop.
                let _ = self.queue.delete(&message.receipt_handle).await;
                return Ok(());
            }
        };

        let is_test_notification = envelope
            .detail
            .get("LifecycleTransition")
            .and_then(Value::as_str)
            .is_some_and(|t| t == "autoscaling:TEST_NOTIFICATION");
        if is_test_notification {
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        }

        let time = envelope.time.unwrap_or_else(Utc::now);

        match (envelope.source.as_str(), envelope.detail_type.as_str()) {
            ("aws.autoscaling", "EC2 Instance-terminate Lifecycle Action") => {
                self.handle_lifecycle_terminate(channels, message, &envelope.id, &envelope.detail, time).await
            }
            ("aws.autoscaling", "EC2 Instance-launch Lifecycle Action") => {
                self.handle_lifecycle_launch(channels, message, &envelope.id, &envelope.detail, time).await
            }
            ("aws.ec2", "EC2 Spot Instance Interruption Warning") => {
                self.handle_instance_event(channels, message, &envelope.id, &envelope.detail, Kind::SpotItn, time, None)
                    .await
            }
            ("aws.ec2", "EC2 Instance Rebalance Recommendation") => {
                self.handle_instance_event(
                    channels,
                    message,
                    &envelope.id,
                    &envelope.detail,
                    Kind::RebalanceRecommendation,
                    time,
                    None,
                )
                .await
            }
            ("aws.ec2", "EC2 Instance State-change Notification") => {
                let state = envelope.detail.get("state").and_then(Value::as_str).unwrap_or_default();
                if !STATE_CHANGE_TERMINAL_STATES.contains(&state) {
                    self.queue.delete(&message.receipt_handle).await?;
                    return Ok(());
                }
                self.handle_instance_event(channels, message, &envelope.id, &envelope.detail, Kind::StateChange, time, None)
                    .await
            }
            ("aws.health", "AWS Health Event") => {
                self.handle_health_event(channels, message, &envelope.id, &envelope.detail, time).await
            }
            _ => {
                // Every unsupported (source, detail-type) is treated
                // uniformly as skip + ack rather than erroring on some.
                self.queue.delete(&message.receipt_handle).await?;
                Ok(())
            }
        }
    }

    async fn handle_instance_event(
        &self,
        channels: &EventChannels,
        message: &crate::cloud::queue::QueueMessage,
        envelope_id: &str,
        detail: &Value,
        kind: Kind,
        time: DateTime<Utc>,
        code: Option<String>,
    ) -> Result<(), Error> {
        let Some(instance_id) = detail.get("instance-id").and_then(Value::as_str) else {
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        };

        let instance = match self.resolve_instance(instance_id).await {
            Ok(Some(i)) => i,
            Ok(None) => {
                // Absent/terminated instance: terminal-for-message.
                self.queue.delete(&message.receipt_handle).await?;
                return Ok(());
            }
            Err(e) => return Err(e), // transient: leave message on queue
        };
        if instance.state.as_deref() == Some("terminated") && instance.private_dns_name.is_none() {
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        }

        if !self.is_managed(&instance).await? {
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        }

        let Some(node_name) = instance.private_dns_name.clone() else {
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        };

        channels.route(InterruptionEvent {
            event_id: envelope_id.to_string(),
            kind,
            source: self.kind(),
            node_name,
            instance_id: Some(instance.instance_id.clone()),
            provider_id: None,
            instance_type: instance.instance_type.clone(),
            autoscaling_group_name: None,
            state: EventState::Active,
            start_time: time,
            end_time: None,
            description: format!("{kind} for {instance_id}"),
            code,
            is_managed: true,
            ack: AckState::QueueDelete { receipt_handle: message.receipt_handle.clone() },
        });
        Ok(())
    }

    async fn handle_lifecycle_terminate(
        &self,
        channels: &EventChannels,
        message: &crate::cloud::queue::QueueMessage,
        envelope_id: &str,
        detail: &Value,
        time: DateTime<Utc>,
    ) -> Result<(), Error> {
        let get = |k: &str| detail.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        let instance_id = get("EC2InstanceId");
        if instance_id.is_empty() {
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        }
        let instance = match self.resolve_instance(&instance_id).await {
            Ok(Some(i)) => i,
            Ok(None) => {
                self.queue.delete(&message.receipt_handle).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !self.is_managed(&instance).await? {
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        }
        let Some(node_name) = instance.private_dns_name.clone() else {
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        };

        channels.route(InterruptionEvent {
            event_id: envelope_id.to_string(),
            kind: Kind::AsgLifecycleTerminate,
            source: self.kind(),
            node_name,
            instance_id: Some(instance_id.clone()),
            provider_id: None,
            instance_type: instance.instance_type.clone(),
            autoscaling_group_name: Some(get("AutoScalingGroupName")),
            state: EventState::Active,
            start_time: time,
            end_time: None,
            description: format!("ASG lifecycle termination for {instance_id}"),
            code: None,
            is_managed: true,
            ack: AckState::AsgLifecycleTerminate {
                asg_name: get("AutoScalingGroupName"),
                hook_name: get("LifecycleHookName"),
                token: get("LifecycleActionToken"),
                instance_id,
                receipt_handle: message.receipt_handle.clone(),
            },
        });
        Ok(())
    }

    async fn handle_lifecycle_launch(
        &self,
        channels: &EventChannels,
        message: &crate::cloud::queue::QueueMessage,
        envelope_id: &str,
        detail: &Value,
        time: DateTime<Utc>,
    ) -> Result<(), Error> {
        let get = |k: &str| detail.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        let instance_id = get("EC2InstanceId");
        channels.route(InterruptionEvent {
            event_id: envelope_id.to_string(),
            kind: Kind::AsgLifecycleLaunch,
            source: self.kind(),
            node_name: String::new(),
            instance_id: Some(instance_id.clone()),
            provider_id: None,
            instance_type: None,
            autoscaling_group_name: Some(get("AutoScalingGroupName")),
            state: EventState::Active,
            start_time: time,
            end_time: None,
            description: format!("ASG lifecycle launch for {instance_id}"),
            code: None,
            is_managed: true,
            ack: AckState::AsgLifecycleLaunch {
                asg_name: get("AutoScalingGroupName"),
                hook_name: get("LifecycleHookName"),
                token: get("LifecycleActionToken"),
                instance_id,
                receipt_handle: message.receipt_handle.clone(),
            },
        });
        Ok(())
    }

    async fn handle_health_event(
        &self,
        channels: &EventChannels,
        message: &crate::cloud::queue::QueueMessage,
        envelope_id: &str,
        detail: &Value,
        time: DateTime<Utc>,
    ) -> Result<(), Error> {
        let service = detail.get("service").and_then(Value::as_str).unwrap_or_default();
        let category = detail.get("eventTypeCategory").and_then(Value::as_str).unwrap_or_default();
        if service != "EC2" || category != "scheduledChange" {
            // Unsupported aws.health detail shapes are skipped + acked
            // uniformly rather than erroring on some.
            self.queue.delete(&message.receipt_handle).await?;
            return Ok(());
        }
        let code = detail.get("eventTypeCode").and_then(Value::as_str).map(str::to_string);
        let entities = detail
            .get("affectedEntities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entity in entities {
            let Some(instance_id) = entity.get("entityValue").and_then(Value::as_str) else {
                continue;
            };
            let instance = match self.resolve_instance(instance_id).await {
                Ok(Some(i)) => i,
                Ok(None) => continue,
                Err(e) => return Err(e),
            };
            if !self.is_managed(&instance).await? {
                continue;
            }
            let Some(node_name) = instance.private_dns_name.clone() else {
                continue;
            };
            channels.route(InterruptionEvent {
                event_id: format!("{envelope_id}-{instance_id}"),
                kind: Kind::ScheduledEvent,
                source: self.kind(),
                node_name,
                instance_id: Some(instance_id.to_string()),
                provider_id: None,
                instance_type: instance.instance_type.clone(),
                autoscaling_group_name: None,
                state: EventState::Active,
                start_time: time,
                end_time: None,
                description: "AWS Health scheduled change".to_string(),
                code: code.clone(),
                is_managed: true,
                ack: AckState::QueueDelete { receipt_handle: message.receipt_handle.clone() },
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::queue::QueueMessage;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FixedQueue {
        messages: Mutex<Vec<QueueMessage>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl QueueClient for FixedQueue {
        async fn receive(&self) -> Result<Vec<QueueMessage>, Error> {
            Ok(std::mem::take(&mut *self.messages.lock().unwrap()))
        }
        async fn delete(&self, receipt_handle: &str) -> Result<(), Error> {
            self.deleted.lock().unwrap().push(receipt_handle.to_string());
            Ok(())
        }
    }

    struct FixedEc2(Option<InstanceInfo>);

    #[async_trait::async_trait]
    impl Ec2Client for FixedEc2 {
        async fn describe_instance(&self, _instance_id: &str) -> Result<Option<InstanceInfo>, Error> {
            Ok(self.0.clone())
        }
        async fn describe_tags(&self, _instance_id: &str) -> Result<HashMap<String, String>, Error> {
            Ok(HashMap::new())
        }
    }

    struct NoopAsg;

    #[async_trait::async_trait]
    impl AsgClient for NoopAsg {
        async fn complete_lifecycle_action(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn record_heartbeat(&self, _: &str, _: &str, _: &str, _: &str) -> Result<bool, Error> {
            Ok(false)
        }
        async fn describe_autoscaling_group_for_instance(&self, _: &str) -> Result<Option<String>, Error> {
            Ok(None)
        }
        async fn describe_hook_timeout(&self, _: &str, _: &str) -> Result<Option<i64>, Error> {
            Ok(None)
        }
    }

    fn instance(id: &str) -> InstanceInfo {
        InstanceInfo {
            instance_id: id.to_string(),
            private_dns_name: Some("ip-10-0-0-1".to_string()),
            instance_type: None,
            state: Some("running".to_string()),
            tags: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn asg_lifecycle_terminate_routes_with_ack_state() {
        let body = r#"{"source":"aws.autoscaling","detail-type":"EC2 Instance-terminate Lifecycle Action","id":"msg-1","detail":{"LifecycleActionToken":"T","AutoScalingGroupName":"G","LifecycleHookName":"H","EC2InstanceId":"i-1","LifecycleTransition":"autoscaling:EC2_INSTANCE_TERMINATING"}}"#;
        let queue = Arc::new(FixedQueue {
            messages: Mutex::new(vec![QueueMessage { body: body.to_string(), receipt_handle: "rh-1".to_string() }]),
            deleted: Mutex::new(vec![]),
        });
        let ec2 = Arc::new(FixedEc2(Some(instance("i-1"))));
        let monitor = QueueMonitor::new(queue.clone(), ec2, Arc::new(NoopAsg), None);
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, _crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();

        let event = irx.try_recv().unwrap();
        assert_eq!(event.kind, Kind::AsgLifecycleTerminate);
        assert_eq!(event.event_id, "msg-1", "event id comes from the envelope, not the receipt handle");
        assert!(matches!(event.ack, AckState::AsgLifecycleTerminate { .. }));
        assert!(queue.deleted.lock().unwrap().is_empty(), "delete happens post-drain, not on receive");
    }

    #[tokio::test]
    async fn redelivery_with_a_new_receipt_handle_keeps_the_same_event_id() {
        // SQS hands out a fresh receipt handle on every redelivery of the
        // same logical message; the envelope's own id must be used for
        // dedup so a redelivered message doesn't look like a new event.
        let body = r#"{"source":"aws.ec2","detail-type":"EC2 Instance Rebalance Recommendation","id":"msg-6","detail":{"instance-id":"i-6"}}"#;
        let queue = Arc::new(FixedQueue {
            messages: Mutex::new(vec![QueueMessage { body: body.to_string(), receipt_handle: "rh-6-first".to_string() }]),
            deleted: Mutex::new(vec![]),
        });
        let ec2 = Arc::new(FixedEc2(Some(instance("i-6"))));
        let monitor = QueueMonitor::new(queue.clone(), ec2, Arc::new(NoopAsg), None);
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, _crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();
        let first = irx.try_recv().unwrap();

        queue.messages.lock().unwrap().push(QueueMessage { body: body.to_string(), receipt_handle: "rh-6-second".to_string() });
        let (itx2, mut irx2) = mpsc::unbounded_channel();
        let (ctx2, _crx2) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx2, cancel: ctx2 }).await.unwrap();
        let second = irx2.try_recv().unwrap();

        assert_eq!(first.event_id, second.event_id, "redelivery must dedup to the same EventID");
    }

    #[tokio::test]
    async fn test_notification_is_deleted_without_an_event() {
        let body = r#"{"source":"aws.autoscaling","detail-type":"EC2 Instance-terminate Lifecycle Action","id":"msg-2","detail":{"LifecycleTransition":"autoscaling:TEST_NOTIFICATION"}}"#;
        let queue = Arc::new(FixedQueue {
            messages: Mutex::new(vec![QueueMessage { body: body.to_string(), receipt_handle: "rh-2".to_string() }]),
            deleted: Mutex::new(vec![]),
        });
        let ec2 = Arc::new(FixedEc2(None));
        let monitor = QueueMonitor::new(queue.clone(), ec2, Arc::new(NoopAsg), None);
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, _crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();

        assert!(irx.try_recv().is_err());
        assert_eq!(queue.deleted.lock().unwrap().as_slice(), ["rh-2".to_string()]);
    }

    #[tokio::test]
    async fn already_terminated_instance_is_dropped_without_error() {
        let body = r#"{"source":"aws.ec2","detail-type":"EC2 Instance Rebalance Recommendation","id":"msg-3","detail":{"instance-id":"i-3"}}"#;
        let queue = Arc::new(FixedQueue {
            messages: Mutex::new(vec![QueueMessage { body: body.to_string(), receipt_handle: "rh-3".to_string() }]),
            deleted: Mutex::new(vec![]),
        });
        let ec2 = Arc::new(FixedEc2(None)); // describe-instances returns empty reservations
        let monitor = QueueMonitor::new(queue.clone(), ec2, Arc::new(NoopAsg), None);
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, _crx) = mpsc::unbounded_channel();
        let result = monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await;

        assert!(result.is_ok());
        assert!(irx.try_recv().is_err());
        assert_eq!(queue.deleted.lock().unwrap().as_slice(), ["rh-3".to_string()]);
    }

    #[tokio::test]
    async fn state_change_filters_non_terminal_states() {
        let body = r#"{"source":"aws.ec2","detail-type":"EC2 Instance State-change Notification","id":"msg-4","detail":{"instance-id":"i-4","state":"running"}}"#;
        let queue = Arc::new(FixedQueue {
            messages: Mutex::new(vec![QueueMessage { body: body.to_string(), receipt_handle: "rh-4".to_string() }]),
            deleted: Mutex::new(vec![]),
        });
        let ec2 = Arc::new(FixedEc2(Some(instance("i-4"))));
        let monitor = QueueMonitor::new(queue.clone(), ec2, Arc::new(NoopAsg), None);
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, _crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();

        assert!(irx.try_recv().is_err(), "running is not a terminal state");
        assert_eq!(queue.deleted.lock().unwrap().as_slice(), ["rh-4".to_string()]);
    }

    #[tokio::test]
    async fn managed_filter_drops_unmanaged_instances() {
        let body = r#"{"source":"aws.ec2","detail-type":"EC2 Instance Rebalance Recommendation","id":"msg-5","detail":{"instance-id":"i-5"}}"#;
        let queue = Arc::new(FixedQueue {
            messages: Mutex::new(vec![QueueMessage { body: body.to_string(), receipt_handle: "rh-5".to_string() }]),
            deleted: Mutex::new(vec![]),
        });
        let ec2 = Arc::new(FixedEc2(Some(instance("i-5"))));
        let monitor = QueueMonitor::new(queue.clone(), ec2, Arc::new(NoopAsg), Some("nth/managed".to_string()));
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (ctx, _crx) = mpsc::unbounded_channel();
        monitor.poll(&EventChannels { interrupt: itx, cancel: ctx }).await.unwrap();

        assert!(irx.try_recv().is_err(), "instance lacks the managed tag");
        assert_eq!(queue.deleted.lock().unwrap().as_slice(), ["rh-5".to_string()]);
    }
}
