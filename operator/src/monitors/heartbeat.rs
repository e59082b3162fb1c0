//! Lifecycle-action heartbeat loop: extends an ASG lifecycle hook's
//! timeout while its node drains.

use crate::cloud::AsgClient;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub struct HeartbeatParams {
    pub asg_name: String,
    pub hook_name: String,
    pub token: String,
    pub instance_id: String,
    pub interval: Duration,
    pub heartbeat_until: Duration,
}

/// A handle that stops the heartbeat loop when the post-drain task
/// completes. Dropping it without calling [`HeartbeatHandle::stop`] also
/// stops the loop (the receiver observes a closed channel).
pub struct HeartbeatHandle {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl HeartbeatHandle {
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns the heartbeat loop. Logs a startup warning if `interval >=
/// heartbeat_until`: the node will likely be terminated before the first
/// heartbeat lands.
pub fn spawn_heartbeat(asg: Arc<dyn AsgClient>, params: HeartbeatParams, shutdown: CancellationToken) -> HeartbeatHandle {
    if params.interval >= params.heartbeat_until {
        eprintln!(
            "{} heartbeatInterval ({:?}) >= hookHeartbeatTimeout ({:?}): node may terminate before first heartbeat",
            "[warn]".yellow(),
            params.interval,
            params.heartbeat_until
        );
    }

    let (stop_tx, mut stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + params.heartbeat_until;
        let mut ticker = tokio::time::interval(params.interval);
        loop {
            tokio::select! {
                _ = &mut stop_rx => return,
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => return,
                _ = ticker.tick() => {
                    match asg.record_heartbeat(&params.asg_name, &params.hook_name, &params.token, &params.instance_id).await {
                        Ok(true) => return, // hook already gone
                        Ok(false) => {}
                        Err(e) => {
                            eprintln!("{} heartbeat failed: {e}", "[warn]".yellow());
                        }
                    }
                }
            }
        }
    });

    HeartbeatHandle { stop_tx: Some(stop_tx) }
}
