//! The reconciliation engine: a single-threaded dispatcher on a 1 Hz tick,
//! a counting semaphore for the worker budget, and the two long-lived
//! consumers that feed the store from the monitors' channels.

pub mod handlers;

use crate::actuator::NodeActuator;
use crate::store::EventStore;
use crate::util::colors::{FG1, FG2};
use crate::util::DISPATCH_TICK;
use chrono::{Duration as ChronoDuration, Utc};
use handlers::{run_handler_chain, HandlerContext};
use nth_types::InterruptionEvent;
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use crate::util::metrics::{ACTIVE_DRAINS, EVENTS_PROCESSED};

pub struct Reconciler {
    store: Arc<EventStore>,
    actuator: Arc<NodeActuator>,
    ctx: Arc<HandlerContext>,
    worker_budget: Arc<Semaphore>,
    worker_count: usize,
    lead_time: ChronoDuration,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        store: Arc<EventStore>,
        actuator: Arc<NodeActuator>,
        ctx: Arc<HandlerContext>,
        worker_count: usize,
        lead_time: ChronoDuration,
        shutdown: CancellationToken,
    ) -> Self {
        Reconciler {
            store,
            actuator,
            ctx,
            worker_budget: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            lead_time,
            shutdown,
        }
    }

    pub async fn run(
        &self,
        mut interrupt_rx: mpsc::UnboundedReceiver<InterruptionEvent>,
        mut cancel_rx: mpsc::UnboundedReceiver<InterruptionEvent>,
    ) {
        let mut tick = tokio::time::interval(DISPATCH_TICK);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = interrupt_rx.recv() => {
                    self.store.add(event);
                }
                Some(event) = cancel_rx.recv() => {
                    self.handle_cancel(event).await;
                }
                _ = tick.tick() => {
                    self.dispatch_ready();
                }
            }
        }

        println!("{}", "shutting down: waiting for in-flight drains to finish".yellow());
        // SIGTERM stops new dispatch but lets in-flight workers finish: wait
        // to reclaim every permit before returning.
        let _ = self.worker_budget.acquire_many(self.worker_count as u32).await;
    }

    /// Cancel path: mark ignored/processed; if this was the last
    /// non-ignored event for the node, uncordon and clean up.
    async fn handle_cancel(&self, event: InterruptionEvent) {
        self.store.cancel(&event);
        if !self.store.should_uncordon(&event.node_name) {
            return;
        }
        if let Err(e) = self.actuator.uncordon(&event.node_name).await {
            self.ctx.events.record(&event.node_name, "UncordonError", e.to_string(), true).await;
            return;
        }
        let _ = self.actuator.remove_nth_labels(&event.node_name).await;
        let _ = self.actuator.remove_nth_taints(&event.node_name).await;
        self.ctx
            .events
            .record(&event.node_name, "Uncordon", "no remaining active interruption".to_string(), false)
            .await;
    }

    /// Drains the store's ready queue until either empty or the worker
    /// budget is exhausted (non-blocking `try_acquire`).
    fn dispatch_ready(&self) {
        loop {
            let Ok(permit) = self.worker_budget.clone().try_acquire_owned() else {
                return;
            };
            let Some(event) = self.store.claim_next_active(self.lead_time, Utc::now()) else {
                drop(permit);
                return;
            };
            println!(
                "{}{}{}{}",
                "draining node • node=".color(FG1),
                event.node_name.color(FG2),
                " • event=".color(FG1),
                event.event_id.color(FG2),
            );
            #[cfg(feature = "metrics")]
            ACTIVE_DRAINS.inc();
            let ctx = self.ctx.clone();
            #[cfg(feature = "metrics")]
            let kind = event.kind.to_string();
            tokio::spawn(async move {
                run_handler_chain(&ctx, event).await;
                #[cfg(feature = "metrics")]
                {
                    ACTIVE_DRAINS.dec();
                    EVENTS_PROCESSED.with_label_values(&[&kind]).inc();
                }
                drop(permit);
            });
        }
    }
}
