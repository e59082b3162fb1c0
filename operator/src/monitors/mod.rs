//! Monitors: pollers that translate source-specific wire formats into
//! [`nth_types::InterruptionEvent`]s on two channels.

pub mod asg_state;
pub mod heartbeat;
pub mod queue;
pub mod rebalance;
pub mod scheduled;
pub mod spot;
pub mod supervisor;

use crate::util::Error;
use nth_types::{InterruptionEvent, MonitorKind};
use tokio::sync::mpsc;

/// Where a monitor sends what it observes. Monitors only ever write to
/// these two senders -- they never read the store back.
#[derive(Clone)]
pub struct EventChannels {
    pub interrupt: mpsc::UnboundedSender<InterruptionEvent>,
    pub cancel: mpsc::UnboundedSender<InterruptionEvent>,
}

impl EventChannels {
    /// Routes by `EventState`: Canceled/Completed go to the cancel
    /// channel, everything else to the interrupt channel.
    pub fn route(&self, event: InterruptionEvent) {
        if event.state.is_cancel() {
            let _ = self.cancel.send(event);
        } else {
            let _ = self.interrupt.send(event);
        }
    }
}

#[async_trait::async_trait]
pub trait Monitor: Send + Sync {
    fn kind(&self) -> MonitorKind;
    async fn poll(&self, channels: &EventChannels) -> Result<(), Error>;
}
