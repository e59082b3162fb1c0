//! The handler chain: an ordered sequence of polymorphic handlers that runs
//! to completion for drain/cordon events, dispatched by `Kind` and
//! `AckState` instead of closures bound at monitor time.

use crate::actuator::{DrainOptions, NodeActuator};
use crate::cloud::{AsgClient, QueueClient};
use crate::events::EventRecorder;
use crate::monitors::heartbeat::{spawn_heartbeat, HeartbeatParams};
use crate::store::EventStore;
use crate::webhook::WebhookNotifier;
use nth_types::{AckState, InterruptionEvent, Kind, TaintEffect};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OUT_OF_SERVICE_TAINT_KEY: &str = "node.kubernetes.io/out-of-service";

pub struct HandlerContext {
    pub actuator: Arc<NodeActuator>,
    pub store: Arc<EventStore>,
    pub webhook: Arc<dyn WebhookNotifier>,
    pub events: Arc<dyn EventRecorder>,
    pub queue: Option<Arc<dyn QueueClient>>,
    pub asg: Arc<dyn AsgClient>,
    pub taint_effect: TaintEffect,
    pub drain_options: DrainOptions,
    pub heartbeat_interval: Duration,
    pub heartbeat_until: Duration,
    pub asg_launch_timeout: Duration,
    pub shutdown: CancellationToken,
}

/// Runs the handler chain for one claimed event. Drain/cordon events always
/// complete in one pass and are marked processed unconditionally; handlers
/// log and continue on non-fatal errors. An ASG launch event that never
/// reaches node readiness within its timeout is left unprocessed so it is
/// retried rather than silently dropped.
pub async fn run_handler_chain(ctx: &HandlerContext, event: InterruptionEvent) {
    if event.kind == Kind::AsgLifecycleLaunch {
        if asg_launch_handler(ctx, &event).await {
            ctx.store.mark_processed(&event.event_id);
        }
    } else {
        drain_cordon_handler(ctx, &event).await;
        ctx.store.mark_processed(&event.event_id);
    }
}

/// Polls node readiness up to `ctx.asg_launch_timeout`. Only on success does
/// it complete the ASG lifecycle hook and delete the queue message; a node
/// that never becomes ready is left for a future retry rather than having
/// its lifecycle hook force-completed. Returns whether the hook was
/// completed.
async fn asg_launch_handler(ctx: &HandlerContext, event: &InterruptionEvent) -> bool {
    let AckState::AsgLifecycleLaunch { asg_name, hook_name, token, instance_id, receipt_handle } = &event.ack else {
        return true;
    };

    let deadline = tokio::time::Instant::now() + ctx.asg_launch_timeout;
    let ready = loop {
        let ready = if event.node_name.is_empty() {
            false
        } else {
            ctx.actuator.is_ready(&event.node_name).await.unwrap_or(false)
        };
        if ready {
            break true;
        }
        if tokio::time::Instant::now() >= deadline {
            break false;
        }
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return false,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    };

    if !ready {
        eprintln!("node {} did not become ready before launch timeout, leaving event for retry", event.node_name);
        return false;
    }

    if let Err(e) = ctx.asg.complete_lifecycle_action(asg_name, hook_name, token, instance_id).await {
        eprintln!("failed to complete ASG launch hook for {instance_id}: {e}");
        return false;
    }
    delete_message(ctx, receipt_handle).await;
    true
}

async fn drain_cordon_handler(ctx: &HandlerContext, event: &InterruptionEvent) {
    ctx.webhook.notify(event).await;

    pre_drain(ctx, event).await;

    let mut heartbeat_handle = start_heartbeat_if_needed(ctx, event);

    if let Err(e) = ctx.actuator.cordon(&event.node_name).await {
        ctx.events.record(&event.node_name, "CordonError", e.to_string(), true).await;
    }
    ctx.store.mark_node_processed(&event.event_id);

    let drain_started = tokio::time::Instant::now();
    if let Err(e) = ctx.actuator.drain(&event.node_name, &ctx.drain_options).await {
        ctx.events.record(&event.node_name, "DrainError", e.to_string(), true).await;
    } else {
        ctx.store.mark_drained(&event.event_id);
        println!(
            "drained node {} in {}",
            event.node_name,
            humantime::format_duration(drain_started.elapsed())
        );
    }

    if let Some(handle) = heartbeat_handle.as_mut() {
        handle.stop();
    }

    post_drain(ctx, event).await;

    if ctx.taint_effect == TaintEffect::NoExecute {
        if let Err(e) = ctx
            .actuator
            .add_taint(&event.node_name, OUT_OF_SERVICE_TAINT_KEY, "nodeshutdown", TaintEffect::NoExecute)
            .await
        {
            ctx.events.record(&event.node_name, "DrainError", e.to_string(), true).await;
        }
    }
}

async fn pre_drain(ctx: &HandlerContext, event: &InterruptionEvent) {
    let Some(taint_key) = event.kind.taint_key() else { return };
    if let Err(e) = ctx
        .actuator
        .add_taint(&event.node_name, taint_key, &event.taint_value(), ctx.taint_effect)
        .await
    {
        ctx.events.record(&event.node_name, "MonitorError", e.to_string(), true).await;
        return;
    }

    if matches!(event.kind, Kind::ScheduledEvent | Kind::StateChange) && event.is_reboot_class() {
        if let Err(e) = ctx.actuator.mark_with_event_id(&event.node_name, &event.event_id).await {
            ctx.events.record(&event.node_name, "MonitorError", e.to_string(), true).await;
            return;
        }
        let already_unschedulable = ctx.actuator.is_labeled_with_action(&event.node_name).await.unwrap_or(false);
        if !already_unschedulable {
            if let Err(e) = ctx.actuator.mark_for_uncordon_after_reboot(&event.node_name, &event.event_id).await {
                ctx.events.record(&event.node_name, "MonitorError", e.to_string(), true).await;
            }
        }
    }
}

fn start_heartbeat_if_needed(
    ctx: &HandlerContext,
    event: &InterruptionEvent,
) -> Option<crate::monitors::heartbeat::HeartbeatHandle> {
    let AckState::AsgLifecycleTerminate { asg_name, hook_name, token, instance_id, .. } = &event.ack else {
        return None;
    };
    Some(spawn_heartbeat(
        ctx.asg.clone(),
        HeartbeatParams {
            asg_name: asg_name.clone(),
            hook_name: hook_name.clone(),
            token: token.clone(),
            instance_id: instance_id.clone(),
            interval: ctx.heartbeat_interval,
            heartbeat_until: ctx.heartbeat_until,
        },
        ctx.shutdown.clone(),
    ))
}

async fn post_drain(ctx: &HandlerContext, event: &InterruptionEvent) {
    match &event.ack {
        AckState::None => {}
        AckState::QueueDelete { receipt_handle } => {
            delete_message(ctx, receipt_handle).await;
            record_ack_done(ctx, event).await;
        }
        AckState::AsgLifecycleTerminate { asg_name, hook_name, token, instance_id, receipt_handle } => {
            if let Err(e) = ctx.asg.complete_lifecycle_action(asg_name, hook_name, token, instance_id).await {
                eprintln!("failed to complete ASG terminate hook for {instance_id}: {e}");
                return;
            }
            delete_message(ctx, receipt_handle).await;
            record_ack_done(ctx, event).await;
        }
        AckState::AsgLifecycleLaunch { .. } => {}
    }
}

async fn delete_message(ctx: &HandlerContext, receipt_handle: &str) {
    if let Some(queue) = &ctx.queue {
        if let Err(e) = queue.delete(receipt_handle).await {
            eprintln!("failed to delete queue message {receipt_handle}: {e}");
        }
    }
}

async fn record_ack_done(ctx: &HandlerContext, event: &InterruptionEvent) {
    ctx.events.record(&event.node_name, "Uncordon", format!("{} processed", event.event_id), false).await;
}
