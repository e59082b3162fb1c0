//! Monitor supervisor: runs one monitor on its configured tick,
//! panicking the process after `DUPLICATE_ERROR_THRESHOLD` consecutive
//! identical error strings.

use super::{EventChannels, Monitor};
use crate::util::DUPLICATE_ERROR_THRESHOLD;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use crate::util::metrics::{MONITOR_ERRORS, MONITOR_POLLS};

/// Runs one monitor on `poll_interval`, panicking the process after
/// `DUPLICATE_ERROR_THRESHOLD` consecutive identical error strings. Each
/// monitor gets its own interval: metadata monitors use the configurable
/// `METADATA_TICK_SECS`, while the queue monitor passes a near-zero
/// interval since its own long-poll `receive()` call already throttles.
pub async fn supervise(monitor: Arc<dyn Monitor>, channels: EventChannels, poll_interval: Duration, shutdown: CancellationToken) {
    let mut last_error: Option<String> = None;
    let mut repeat_count = 0usize;
    let kind = monitor.kind();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match monitor.poll(&channels).await {
            Ok(()) => {
                repeat_count = 0;
                last_error = None;
                #[cfg(feature = "metrics")]
                MONITOR_POLLS.with_label_values(&[&kind.to_string()]).inc();
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                MONITOR_ERRORS.with_label_values(&[&kind.to_string()]).inc();
                let message = e.to_string();
                eprintln!("{} {kind} poll failed: {message}", "[error]".red());
                if last_error.as_deref() == Some(message.as_str()) {
                    repeat_count += 1;
                } else {
                    repeat_count = 1;
                    last_error = Some(message);
                }
                if repeat_count >= DUPLICATE_ERROR_THRESHOLD {
                    panic!("{kind} monitor failed {repeat_count} times in a row with the same error; forcing restart");
                }
            }
        }
    }
}
