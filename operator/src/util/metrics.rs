use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MONITOR_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("nth_monitor_errors_total", "errors returned by a monitor's poll()"),
        &["monitor"],
    )
    .unwrap();
    pub static ref MONITOR_POLLS: IntCounterVec = IntCounterVec::new(
        Opts::new("nth_monitor_polls_total", "successful poll() calls"),
        &["monitor"],
    )
    .unwrap();
    pub static ref EVENTS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("nth_events_processed_total", "events dispatched by kind"),
        &["kind"],
    )
    .unwrap();
    pub static ref ACTIVE_DRAINS: IntGauge =
        IntGauge::new("nth_active_drains", "nodes currently being drained").unwrap();
}

/// Registers every metric above into [`REGISTRY`]. Called once at startup.
pub fn register() {
    let _ = REGISTRY.register(Box::new(MONITOR_ERRORS.clone()));
    let _ = REGISTRY.register(Box::new(MONITOR_POLLS.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_PROCESSED.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_DRAINS.clone()));
}
