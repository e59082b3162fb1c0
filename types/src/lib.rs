use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Label/annotation/taint key prefix this agent owns on every node it touches.
pub const OWNER: &str = "node-termination-handler.k8s.io";

/// Bare (unqualified) label names; qualify with [`label_key`] before use.
pub mod labels {
    /// Intent recorded before a reboot-class event drains a node, so a
    /// later restart of the agent can detect the reboot happened and
    /// uncordon automatically.
    pub const ACTION: &str = "action";
    pub const ACTION_TIME: &str = "action-time";
    pub const EVENT_ID: &str = "event-id";
}

/// Value recorded under [`labels::ACTION`] to mean "restore scheduling once
/// the node has rebooted".
pub const ACTION_UNCORDON_AFTER_REBOOT: &str = "UncordonAfterReboot";

/// Returns `<OWNER>/<bare>`, the fully qualified label/annotation key.
pub fn label_key(bare: &str) -> String {
    format!("{OWNER}/{bare}")
}

/// Taint keys, one per [`Kind`] that drains a node. Values are always
/// truncated to [`TAINT_VALUE_MAX_LEN`] to respect the Kubernetes taint
/// value length limit.
pub mod taints {
    pub const SPOT_ITN: &str = "spot-itn";
    pub const SCHEDULED_MAINTENANCE: &str = "scheduled-maintenance";
    pub const ASG_LIFECYCLE_TERMINATION: &str = "asg-lifecycle-termination";
    pub const REBALANCE_RECOMMENDATION: &str = "rebalance-recommendation";

    pub const ALL: &[&str] = &[
        SPOT_ITN,
        SCHEDULED_MAINTENANCE,
        ASG_LIFECYCLE_TERMINATION,
        REBALANCE_RECOMMENDATION,
    ];
}

/// Kubernetes taint values are capped at 63 characters.
pub const TAINT_VALUE_MAX_LEN: usize = 63;

/// Truncates `s` to [`TAINT_VALUE_MAX_LEN`] bytes on a char boundary.
pub fn truncate_taint_value(s: &str) -> String {
    if s.len() <= TAINT_VALUE_MAX_LEN {
        return s.to_owned();
    }
    let mut end = TAINT_VALUE_MAX_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

/// Effect applied with a taint. Configurable per deployment; defaults to
/// `NoSchedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaintEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            other => Err(format!("unknown taint effect: {other}")),
        }
    }
}

/// Which monitor originated an event. Purely observational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorKind {
    SpotItnMetadata,
    ScheduledMetadata,
    AsgTargetStateMetadata,
    RebalanceMetadata,
    Queue,
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorKind::SpotItnMetadata => "spot-itn-metadata",
            MonitorKind::ScheduledMetadata => "scheduled-metadata",
            MonitorKind::AsgTargetStateMetadata => "asg-target-state-metadata",
            MonitorKind::RebalanceMetadata => "rebalance-metadata",
            MonitorKind::Queue => "queue",
        };
        write!(f, "{s}")
    }
}

/// The six interruption kinds this agent reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    SpotItn,
    ScheduledEvent,
    RebalanceRecommendation,
    StateChange,
    AsgLifecycleTerminate,
    AsgLifecycleLaunch,
}

impl Kind {
    /// The taint this kind applies while draining. `AsgLifecycleLaunch`
    /// never drains a node, so it has none.
    pub fn taint_key(self) -> Option<&'static str> {
        match self {
            Kind::SpotItn => Some(taints::SPOT_ITN),
            Kind::ScheduledEvent | Kind::StateChange => Some(taints::SCHEDULED_MAINTENANCE),
            Kind::AsgLifecycleTerminate => Some(taints::ASG_LIFECYCLE_TERMINATION),
            Kind::RebalanceRecommendation => Some(taints::REBALANCE_RECOMMENDATION),
            Kind::AsgLifecycleLaunch => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::SpotItn => "SpotITN",
            Kind::ScheduledEvent => "ScheduledEvent",
            Kind::RebalanceRecommendation => "RebalanceRecommendation",
            Kind::StateChange => "StateChange",
            Kind::AsgLifecycleTerminate => "ASGLifecycleTerminate",
            Kind::AsgLifecycleLaunch => "ASGLifecycleLaunch",
        };
        write!(f, "{s}")
    }
}

/// Source-reported lifecycle state. Anything other than `Active` routes to
/// the cancel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    Active,
    Canceled,
    Completed,
}

impl EventState {
    pub fn is_cancel(self) -> bool {
        matches!(self, EventState::Canceled | EventState::Completed)
    }
}

/// Reboot-class scheduled-maintenance codes. Entries with one of these
/// codes get the `UncordonAfterReboot` treatment.
pub const REBOOT_CLASS_CODES: &[&str] = &[
    "instance-stop",
    "system-reboot",
    "instance-reboot",
    "instance-retirement",
];

pub fn is_reboot_class_code(code: &str) -> bool {
    REBOOT_CLASS_CODES.contains(&code)
}

/// Source-specific acknowledgement state, bound by the monitor that
/// constructed the event. The reconciler's handlers pattern-match on this
/// (and on `Kind`) instead of invoking opaque closures, so events stay
/// `Send + Sync + Serialize` and are trivial to construct in tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AckState {
    /// Nothing to acknowledge (metadata-sourced events other than queue
    /// ones have no ack step beyond the drain itself).
    #[default]
    None,
    /// Delete the queue message once processing completes.
    QueueDelete { receipt_handle: String },
    /// Issue `CompleteLifecycleAction(CONTINUE)` then delete the message.
    AsgLifecycleTerminate {
        asg_name: String,
        hook_name: String,
        token: String,
        instance_id: String,
        receipt_handle: String,
    },
    /// Wait for the new node to be Ready (optionally), then continue the
    /// launch hook and delete the message.
    AsgLifecycleLaunch {
        asg_name: String,
        hook_name: String,
        token: String,
        instance_id: String,
        receipt_handle: String,
    },
}

/// The normalized unit of work every monitor produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptionEvent {
    pub event_id: String,
    pub kind: Kind,
    pub source: MonitorKind,
    pub node_name: String,
    pub instance_id: Option<String>,
    pub provider_id: Option<String>,
    pub instance_type: Option<String>,
    pub autoscaling_group_name: Option<String>,
    pub state: EventState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub description: String,
    /// Cloud-reported maintenance code, e.g. `system-reboot`. Only
    /// populated for `Kind::ScheduledEvent`.
    pub code: Option<String>,
    pub is_managed: bool,
    pub ack: AckState,
}

impl InterruptionEvent {
    /// True if this event's code means the node will reboot rather than be
    /// replaced, and so should get the `UncordonAfterReboot` treatment.
    pub fn is_reboot_class(&self) -> bool {
        self.code.as_deref().is_some_and(is_reboot_class_code)
    }

    pub fn taint_value(&self) -> String {
        truncate_taint_value(&self.event_id)
    }
}

/// Deterministic EventID for sources that don't carry their own stable ID.
/// Node identity is folded into the hash: two distinct nodes that land on
/// the same source-truncated timestamp must not collapse onto one EventID.
pub fn hash_event_id(kind: Kind, node_name: &str, key_fields: &[&str], time_bucket: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(node_name.as_bytes());
    for field in key_fields {
        hasher.update(b"|");
        hasher.update(field.as_bytes());
    }
    hasher.update(b"|");
    hasher.update(time_bucket.as_bytes());
    let digest = hasher.finalize();
    format!("{}-{}", kind_prefix(kind), hex::encode(&digest[..16]))
}

fn kind_prefix(kind: Kind) -> &'static str {
    match kind {
        Kind::SpotItn => "spot-itn",
        Kind::ScheduledEvent => "scheduled-event",
        Kind::RebalanceRecommendation => "rebalance",
        Kind::StateChange => "state-change",
        Kind::AsgLifecycleTerminate => "asg-terminate",
        Kind::AsgLifecycleLaunch => "asg-launch",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "x".repeat(100);
        let truncated = truncate_taint_value(&long);
        assert_eq!(truncated.len(), TAINT_VALUE_MAX_LEN);
    }

    #[test]
    fn truncate_is_noop_under_limit() {
        assert_eq!(truncate_taint_value("short"), "short");
    }

    #[test]
    fn hash_includes_node_identity() {
        let a = hash_event_id(Kind::AsgLifecycleTerminate, "node-a", &["Terminated"], "2020-01-01T00:00");
        let b = hash_event_id(Kind::AsgLifecycleTerminate, "node-b", &["Terminated"], "2020-01-01T00:00");
        assert_ne!(a, b, "distinct nodes must not collapse onto the same EventID");
    }

    #[test]
    fn hash_is_deterministic() {
        let a = hash_event_id(Kind::RebalanceRecommendation, "node-a", &[], "2020-01-01T00:00");
        let b = hash_event_id(Kind::RebalanceRecommendation, "node-a", &[], "2020-01-01T00:00");
        assert_eq!(a, b);
    }

    #[test]
    fn reboot_class_codes_detected() {
        assert!(is_reboot_class_code("system-reboot"));
        assert!(!is_reboot_class_code("instance-retirement-cancelled"));
    }

    #[test]
    fn event_state_routes_cancel() {
        assert!(EventState::Canceled.is_cancel());
        assert!(EventState::Completed.is_cancel());
        assert!(!EventState::Active.is_cancel());
    }
}
