use clap::Parser;
use std::time::Duration;

/// Which monitors to run. Each toggle is independent; the queue monitor is
/// the only one that is not per-node.
#[derive(Parser, Debug, Clone)]
pub struct MonitorArgs {
    #[arg(long, env = "ENABLE_SPOT_ITN", default_value_t = true)]
    pub enable_spot_itn: bool,

    #[arg(long, env = "ENABLE_SCHEDULED_EVENTS", default_value_t = true)]
    pub enable_scheduled_events: bool,

    #[arg(long, env = "ENABLE_ASG_TARGET_STATE", default_value_t = true)]
    pub enable_asg_target_state: bool,

    #[arg(long, env = "ENABLE_REBALANCE_RECOMMENDATION", default_value_t = true)]
    pub enable_rebalance_recommendation: bool,

    #[arg(long, env = "ENABLE_QUEUE_PROCESSOR", default_value_t = false)]
    pub enable_queue_processor: bool,

    /// Filter out instances that don't carry the management tag, either
    /// directly or via their ASG's tags.
    #[arg(long, env = "CHECK_IF_MANAGED", default_value_t = false)]
    pub check_if_managed: bool,

    #[arg(long, env = "MANAGED_TAG", default_value = "aws-node-termination-handler/managed")]
    pub managed_tag: String,

    #[arg(long, env = "METADATA_TICK_SECS", default_value_t = 2)]
    pub metadata_tick_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct AwsArgs {
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    #[arg(long, env = "QUEUE_URL")]
    pub queue_url: Option<String>,

    #[arg(long, env = "QUEUE_MAX_MESSAGES", default_value_t = 5)]
    pub queue_max_messages: i32,

    #[arg(long, env = "QUEUE_WAIT_SECS", default_value_t = 20)]
    pub queue_wait_secs: i32,

    #[arg(long, env = "QUEUE_VISIBILITY_SECS", default_value_t = 20)]
    pub queue_visibility_secs: i32,
}

/// Bounds concurrent drains.
#[derive(Parser, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long, env = "WORKER_COUNT", default_value_t = 10)]
    pub worker_count: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct DrainArgs {
    #[arg(long, env = "NODE_TERMINATION_GRACE_PERIOD_SECS", default_value_t = 120)]
    pub node_termination_grace_period_secs: u64,

    #[arg(long, env = "POD_TERMINATION_GRACE_PERIOD_SECS")]
    pub pod_termination_grace_period_secs: Option<i64>,

    #[arg(long, env = "IGNORE_DAEMON_SETS", default_value_t = true)]
    pub ignore_daemon_sets: bool,

    #[arg(long, env = "DELETE_EMPTY_DIR_DATA", default_value_t = false)]
    pub delete_empty_dir_data: bool,
}

impl DrainArgs {
    pub fn node_termination_grace_period(&self) -> Duration {
        Duration::from_secs(self.node_termination_grace_period_secs)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct TaintArgs {
    #[arg(long, env = "TAINT_EFFECT", default_value = "NoSchedule")]
    pub effect: String,

    /// Lead time before `StartTime` at which an event becomes eligible for
    /// dispatch (`GetActiveEvent`'s `now >= StartTime - leadTime`).
    #[arg(long, env = "LEAD_TIME_SECS", default_value_t = 0)]
    pub lead_time_secs: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct HeartbeatArgs {
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 60)]
    pub heartbeat_interval_secs: u64,

    /// Absolute deadline after which the heartbeat loop gives up regardless
    /// of drain progress.
    #[arg(long, env = "HEARTBEAT_UNTIL_SECS", default_value_t = 7200)]
    pub heartbeat_until_secs: u64,

    /// The lifecycle hook's own configured timeout, used only to emit a
    /// startup warning when the heartbeat interval can't keep up with it.
    #[arg(long, env = "HOOK_HEARTBEAT_TIMEOUT_SECS", default_value_t = 300)]
    pub hook_heartbeat_timeout_secs: u64,
}

/// The webhook notifier's HTTP client and template engine are not
/// implemented here, only the flags needed to validate presence at boot.
#[derive(Parser, Debug, Clone)]
pub struct WebhookArgs {
    #[arg(long, env = "WEBHOOK_URL")]
    pub url: Option<String>,

    #[arg(long, env = "WEBHOOK_TEMPLATE")]
    pub template: Option<String>,
}
