use clap::Parser;
use kube::Client;
use nth_common::args::{AwsArgs, DrainArgs, HeartbeatArgs, MonitorArgs, TaintArgs, WebhookArgs, WorkerArgs};
use nth_types::TaintEffect;
use owo_colors::OwoColorize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod actuator;
mod cloud;
mod events;
mod monitors;
mod reconciler;
mod store;
mod util;

use actuator::{DrainOptions, NodeActuator, ProcUptimeProbe, UptimeProbe};
use cloud::asg::AwsAsgClient;
use cloud::ec2::AwsEc2Client;
use cloud::metadata::ImdsClient;
use cloud::queue::{QueueClientOptions, SqsQueueClient};
use cloud::{AsgClient, Ec2Client, MetadataClient, QueueClient};
use events::{EventRecorder, KubeEventRecorder, NoopEventRecorder};
use monitors::asg_state::AsgTargetStateMonitor;
use monitors::queue::QueueMonitor;
use monitors::rebalance::RebalanceMonitor;
use monitors::scheduled::ScheduledMonitor;
use monitors::spot::SpotItnMonitor;
use monitors::supervisor::supervise;
use monitors::{EventChannels, Monitor};
use reconciler::handlers::HandlerContext;
use reconciler::Reconciler;
use store::EventStore;
use webhook::{NoopWebhookNotifier, WebhookNotifier};

mod webhook;

/// Top-level CLI configuration for the binary.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    monitors: MonitorArgs,
    #[command(flatten)]
    aws: AwsArgs,
    #[command(flatten)]
    worker: WorkerArgs,
    #[command(flatten)]
    drain: DrainArgs,
    #[command(flatten)]
    taint: TaintArgs,
    #[command(flatten)]
    heartbeat: HeartbeatArgs,
    #[command(flatten)]
    webhook: WebhookArgs,

    /// IMDS base URL. Overridable for tests; defaults to the real endpoint.
    #[arg(long, env = "METADATA_URL", default_value = "http://169.254.169.254")]
    metadata_url: String,

    /// Node this process is running on, for the per-node metadata monitors.
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Log every mutation instead of performing it.
    #[arg(long, env = "DRY_RUN", default_value_t = false)]
    dry_run: bool,

    /// Emit Kubernetes Events against affected nodes.
    #[arg(long, env = "EMIT_KUBERNETES_EVENTS", default_value_t = true)]
    emit_kubernetes_events: bool,

    /// Prometheus metrics server scrape port. Disabled by default.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

async fn run(client: Client, cli: Cli) {
    let taint_effect = TaintEffect::from_str(&cli.taint.effect).unwrap_or_default();
    // A configured webhook URL that isn't a valid URL means the webhook can
    // never fire, so fail fast at boot rather than silently dropping every
    // notification later.
    if let Some(url) = &cli.webhook.url {
        reqwest::Url::parse(url).unwrap_or_else(|e| panic!("invalid WEBHOOK_URL {url}: {e}"));
    }

    let shutdown = CancellationToken::new();

    #[cfg(feature = "metrics")]
    util::metrics::register();

    let actuator = Arc::new(NodeActuator::new(client.clone(), cli.dry_run));
    let store = Arc::new(EventStore::new());

    if let Some(node_name) = &cli.node_name {
        reconcile_reboot_resume(&actuator, &store, node_name).await;
    }

    let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
    let channels = EventChannels { interrupt: interrupt_tx, cancel: cancel_tx };

    let mut aws_config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &cli.aws.region {
        aws_config_loader = aws_config_loader.region(aws_types::region::Region::new(region.clone()));
    }
    let aws_config = aws_config_loader.load().await;

    let asg: Arc<dyn AsgClient> = Arc::new(AwsAsgClient::new(aws_sdk_autoscaling::Client::new(&aws_config)));
    let ec2: Arc<dyn Ec2Client> = Arc::new(AwsEc2Client::new(aws_sdk_ec2::Client::new(&aws_config)));

    let queue_client: Option<Arc<dyn QueueClient>> = cli.aws.queue_url.as_ref().map(|url| {
        let options = QueueClientOptions {
            max_messages: cli.aws.queue_max_messages,
            wait_seconds: cli.aws.queue_wait_secs,
            visibility_timeout_seconds: cli.aws.queue_visibility_secs,
        };
        Arc::new(SqsQueueClient::new(aws_sdk_sqs::Client::new(&aws_config), url.clone(), options)) as Arc<dyn QueueClient>
    });

    spawn_monitors(&cli, &channels, &asg, &ec2, queue_client.clone(), shutdown.clone());

    let events_recorder: Arc<dyn EventRecorder> = if cli.emit_kubernetes_events {
        Arc::new(KubeEventRecorder::new(client.clone()))
    } else {
        Arc::new(NoopEventRecorder)
    };

    let handler_ctx = Arc::new(HandlerContext {
        actuator: actuator.clone(),
        store: store.clone(),
        webhook: Arc::new(NoopWebhookNotifier) as Arc<dyn WebhookNotifier>,
        events: events_recorder,
        queue: queue_client,
        asg: asg.clone(),
        taint_effect,
        drain_options: DrainOptions {
            ignore_daemon_sets: cli.drain.ignore_daemon_sets,
            delete_empty_dir_data: cli.drain.delete_empty_dir_data,
            grace_period: cli.drain.node_termination_grace_period(),
            pod_grace_period_override: cli
                .drain
                .pod_termination_grace_period_secs
                .map(|secs| Duration::from_secs(secs.max(0) as u64)),
        },
        heartbeat_interval: Duration::from_secs(cli.heartbeat.heartbeat_interval_secs),
        heartbeat_until: Duration::from_secs(cli.heartbeat.heartbeat_until_secs),
        asg_launch_timeout: Duration::from_secs(300),
        shutdown: shutdown.clone(),
    });

    if cli.heartbeat.heartbeat_interval_secs >= cli.heartbeat.hook_heartbeat_timeout_secs {
        eprintln!(
            "{} heartbeatInterval ({}) >= hookHeartbeatTimeout ({}): node may terminate before first heartbeat",
            "[warn]".yellow(),
            cli.heartbeat.heartbeat_interval_secs,
            cli.heartbeat.hook_heartbeat_timeout_secs
        );
    }

    let reconciler = Reconciler::new(
        store,
        actuator,
        handler_ctx,
        cli.worker.worker_count,
        chrono::Duration::seconds(cli.taint.lead_time_secs),
        shutdown.clone(),
    );

    nth_common::signal_ready();

    tokio::select! {
        _ = reconciler.run(interrupt_rx, cancel_rx) => {}
        _ = nth_common::shutdown::shutdown_signal() => {
            shutdown.cancel();
        }
    }
}

/// On startup, detect nodes this process previously marked
/// `UncordonAfterReboot` whose machine has since rebooted, and clean them
/// up.
async fn reconcile_reboot_resume(actuator: &NodeActuator, store: &EventStore, node_name: &str) {
    let uptime = match ProcUptimeProbe.uptime().await {
        Ok(u) => u,
        Err(e) => {
            eprintln!("{} could not read system uptime: {e}", "[warn]".yellow());
            return;
        }
    };
    match actuator.uncordon_if_rebooted(node_name, uptime).await {
        Ok(Some(event_id)) => store.ignore(&event_id),
        Ok(None) => {}
        Err(e) => eprintln!("{} reboot-resume check failed: {e}", "[warn]".yellow()),
    }
}

fn spawn_monitors(
    cli: &Cli,
    channels: &EventChannels,
    asg: &Arc<dyn AsgClient>,
    ec2: &Arc<dyn Ec2Client>,
    queue_client: Option<Arc<dyn QueueClient>>,
    shutdown: CancellationToken,
) {
    let node_name = cli.node_name.clone().unwrap_or_default();
    let metadata: Arc<dyn MetadataClient> = Arc::new(ImdsClient::new(cli.metadata_url.clone()));
    let metadata_tick = Duration::from_secs(cli.monitors.metadata_tick_secs);

    let mut enabled: Vec<(Arc<dyn Monitor>, Duration)> = Vec::new();
    if cli.monitors.enable_spot_itn {
        enabled.push((Arc::new(SpotItnMonitor::new(metadata.clone(), node_name.clone())), metadata_tick));
    }
    if cli.monitors.enable_scheduled_events {
        enabled.push((Arc::new(ScheduledMonitor::new(metadata.clone(), node_name.clone())), metadata_tick));
    }
    if cli.monitors.enable_asg_target_state {
        enabled.push((Arc::new(AsgTargetStateMonitor::new(metadata.clone(), node_name.clone())), metadata_tick));
    }
    if cli.monitors.enable_rebalance_recommendation {
        enabled.push((Arc::new(RebalanceMonitor::new(metadata, node_name)), metadata_tick));
    }
    if cli.monitors.enable_queue_processor {
        if let Some(queue) = queue_client {
            let managed_tag = cli.monitors.check_if_managed.then(|| cli.monitors.managed_tag.clone());
            enabled.push((
                Arc::new(QueueMonitor::new(queue, ec2.clone(), asg.clone(), managed_tag)),
                Duration::from_millis(100),
            ));
        } else {
            eprintln!("{} queue processor enabled but no QUEUE_URL configured", "[warn]".red());
        }
    }

    for (monitor, interval) in enabled {
        let channels = channels.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { supervise(monitor, channels, interval, shutdown).await });
    }
}

#[tokio::main]
async fn main() {
    nth_common::init();

    let client: Client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable.");

    let cli = Cli::parse();
    run(client, cli).await;

    println!("{}", "clean shutdown".green());
}
