//! The node actuator: the idempotent, conflict-retrying mutator of node
//! state.

mod logic;

use crate::util::patch::patch_object;
use crate::util::Error;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams};
use kube::{Api, Client, ResourceExt};
use nth_types::{label_key, labels, TaintEffect, ACTION_UNCORDON_AFTER_REBOOT};
use owo_colors::OwoColorize;
use std::time::Duration;

/// Reads how long the local machine has been up. The real implementation
/// reads `/proc/uptime`; tests inject a fixed value.
#[async_trait::async_trait]
pub trait UptimeProbe: Send + Sync {
    async fn uptime(&self) -> Result<Duration, Error>;
}

pub struct ProcUptimeProbe;

#[async_trait::async_trait]
impl UptimeProbe for ProcUptimeProbe {
    async fn uptime(&self) -> Result<Duration, Error> {
        let contents = tokio::fs::read_to_string("/proc/uptime").await?;
        let secs: f64 = contents
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::UserInput("malformed /proc/uptime".to_string()))?;
        Ok(Duration::from_secs_f64(secs))
    }
}

pub struct DrainOptions {
    pub ignore_daemon_sets: bool,
    pub delete_empty_dir_data: bool,
    pub grace_period: Duration,
    /// When set, overrides every pod's own `terminationGracePeriodSeconds`
    /// during eviction instead of merely filling in a default for pods that
    /// don't specify one.
    pub pod_grace_period_override: Option<Duration>,
}

pub struct NodeActuator {
    client: Client,
    dry_run: bool,
}

impl NodeActuator {
    pub fn new(client: Client, dry_run: bool) -> Self {
        NodeActuator { client, dry_run }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Fetches the latest node object by name, falling back to a
    /// label-selector lookup on the well-known hostname label when a plain
    /// get by name fails (nodes registered under a different name than
    /// their private-DNS hostname).
    async fn get_node(&self, node_name: &str) -> Result<Node, Error> {
        match self.nodes().get(node_name).await {
            Ok(node) => Ok(node),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let selector = format!("kubernetes.io/hostname={node_name}");
                let list = self
                    .nodes()
                    .list(&ListParams::default().labels(&selector))
                    .await?;
                list.items
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::NodeNotFound(node_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch<F>(&self, node_name: &str, node: &Node, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Node),
    {
        if self.dry_run {
            println!("{} {node_name}", "[dry-run] would patch node".yellow());
            return Ok(());
        }
        patch_object(self.client.clone(), node, f).await.map(|_| ())
    }

    /// True if the node exists and reports `Ready=True` in its conditions.
    /// Used by the ASG-launch handler to gate continuing the launch hook.
    pub async fn is_ready(&self, node_name: &str) -> Result<bool, Error> {
        match self.get_node(node_name).await {
            Ok(node) => Ok(node
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))),
            Err(Error::NodeNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn cordon(&self, node_name: &str) -> Result<(), Error> {
        self.set_unschedulable(node_name, true).await
    }

    pub async fn uncordon(&self, node_name: &str) -> Result<(), Error> {
        self.set_unschedulable(node_name, false).await
    }

    async fn set_unschedulable(&self, node_name: &str, unschedulable: bool) -> Result<(), Error> {
        let node = self.get_node(node_name).await?;
        let current = node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
        if current == unschedulable {
            return Ok(());
        }
        self.patch(node_name, &node, |n| {
            n.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        })
        .await
    }

    pub async fn add_taint(&self, node_name: &str, key: &str, value: &str, effect: TaintEffect) -> Result<(), Error> {
        let node = self.get_node(node_name).await?;
        let existing = node.spec.as_ref().and_then(|s| s.taints.clone()).unwrap_or_default();
        let (new_taints, changed) = logic::add_taint(existing, key, value, &effect.to_string());
        if !changed {
            return Ok(());
        }
        self.patch(node_name, &node, |n| {
            n.spec.get_or_insert_with(Default::default).taints = Some(new_taints);
        })
        .await
    }

    pub async fn remove_nth_taints(&self, node_name: &str) -> Result<(), Error> {
        let node = self.get_node(node_name).await?;
        let existing = node.spec.as_ref().and_then(|s| s.taints.clone()).unwrap_or_default();
        let (new_taints, changed) = logic::remove_taints(existing, nth_types::taints::ALL);
        if !changed {
            return Ok(());
        }
        self.patch(node_name, &node, |n| {
            n.spec.get_or_insert_with(Default::default).taints = Some(new_taints);
        })
        .await
    }

    async fn set_label(&self, node_name: &str, node: &Node, key: &str, value: Option<&str>) -> Result<(), Error> {
        let current_labels = node.metadata.labels.clone().unwrap_or_default();
        match value {
            Some(_) if current_labels.get(key).map(String::as_str) == value => return Ok(()),
            None if !current_labels.contains_key(key) => return Ok(()),
            _ => {}
        }
        let key = key.to_string();
        let value = value.map(str::to_string);
        self.patch(node_name, node, move |n| {
            let labels = n.metadata.labels.get_or_insert_with(Default::default);
            match &value {
                Some(v) => {
                    labels.insert(key, v.clone());
                }
                None => {
                    labels.remove(&key);
                }
            }
        })
        .await
    }

    pub async fn add_label(&self, node_name: &str, key: &str, value: &str) -> Result<(), Error> {
        let node = self.get_node(node_name).await?;
        self.set_label(node_name, &node, key, Some(value)).await
    }

    pub async fn remove_label(&self, node_name: &str, key: &str) -> Result<(), Error> {
        let node = self.get_node(node_name).await?;
        self.set_label(node_name, &node, key, None).await
    }

    /// Persists the `UncordonAfterReboot` intent: two labels written
    /// best-effort together. If the second fails, the first is rolled
    /// back so the node is never left half-marked.
    pub async fn mark_for_uncordon_after_reboot(&self, node_name: &str, event_id: &str) -> Result<(), Error> {
        self.add_label(node_name, &label_key(labels::ACTION), ACTION_UNCORDON_AFTER_REBOOT)
            .await?;
        let now = Utc::now().timestamp().to_string();
        if let Err(e) = self.add_label(node_name, &label_key(labels::ACTION_TIME), &now).await {
            let _ = self.remove_label(node_name, &label_key(labels::ACTION)).await;
            return Err(e);
        }
        self.mark_with_event_id(node_name, event_id).await
    }

    pub async fn mark_with_event_id(&self, node_name: &str, event_id: &str) -> Result<(), Error> {
        self.add_label(node_name, &label_key(labels::EVENT_ID), event_id).await
    }

    pub async fn remove_nth_labels(&self, node_name: &str) -> Result<(), Error> {
        for key in [labels::ACTION, labels::ACTION_TIME, labels::EVENT_ID] {
            self.remove_label(node_name, &label_key(key)).await?;
        }
        Ok(())
    }

    pub async fn is_labeled_with_action(&self, node_name: &str) -> Result<bool, Error> {
        let node = self.get_node(node_name).await?;
        Ok(node
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(&label_key(labels::ACTION)))
            .is_some_and(|v| v == ACTION_UNCORDON_AFTER_REBOOT))
    }

    /// UncordonIfRebooted: on startup, if `action-time` is present, decide
    /// whether the machine rebooted since the label was written, and if so
    /// uncordon + remove NTH labels/taints. Returns the recorded event-id
    /// when action was taken, so the caller can mark it ignored in the
    /// store.
    pub async fn uncordon_if_rebooted(&self, node_name: &str, uptime: Duration) -> Result<Option<String>, Error> {
        let node = self.get_node(node_name).await?;
        let node_labels = node.metadata.labels.clone().unwrap_or_default();
        if node_labels.get(&label_key(labels::ACTION)).map(String::as_str) != Some(ACTION_UNCORDON_AFTER_REBOOT) {
            return Ok(None);
        }
        let Some(action_time) = node_labels.get(&label_key(labels::ACTION_TIME)) else {
            return Ok(None);
        };
        let action_time: i64 = action_time
            .parse()
            .map_err(|_| Error::UserInput(format!("malformed {}", label_key(labels::ACTION_TIME))))?;
        let now = Utc::now().timestamp();
        if !logic::has_rebooted_since_marked(now, action_time, uptime.as_secs()) {
            return Ok(None);
        }
        self.uncordon(node_name).await?;
        self.remove_nth_labels(node_name).await?;
        self.remove_nth_taints(node_name).await?;
        Ok(node_labels.get(&label_key(labels::EVENT_ID)).cloned())
    }

    /// Evicts all pods on a node subject to configured filters. Tolerates
    /// already-deleted pods; only pods that could not be evicted within
    /// `opts.grace_period` are reported as errors.
    pub async fn drain(&self, node_name: &str, opts: &DrainOptions) -> Result<(), Error> {
        if self.dry_run {
            println!("{} {node_name}", "[dry-run] would drain node".yellow());
            return Ok(());
        }
        let field_selector = format!("spec.nodeName={node_name}");
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default().fields(&field_selector)).await?;

        let mut failures = Vec::new();
        for pod in list.items {
            if opts.ignore_daemon_sets && is_daemonset_pod(&pod) {
                continue;
            }
            if !opts.delete_empty_dir_data && uses_empty_dir(&pod) {
                failures.push(format!("{} uses emptyDir and deletion was not opted in", pod.name_any()));
                continue;
            }
            let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
            let ns_api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            let grace = match opts.pod_grace_period_override {
                Some(override_grace) => override_grace.as_secs() as i64,
                None => pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.termination_grace_period_seconds)
                    .unwrap_or(opts.grace_period.as_secs() as i64),
            };
            let evict = ns_api
                .evict(
                    &pod.name_any(),
                    &EvictParams {
                        delete_options: Some(DeleteParams {
                            grace_period_seconds: Some(grace as u32),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )
                .await;
            match evict {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => failures.push(format!("{}: {e}", pod.name_any())),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::UserInput(format!("failed to evict: {}", failures.join("; "))))
        }
    }
}

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|o| o.kind == "DaemonSet"))
}

fn uses_empty_dir(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|vols| vols.iter().any(|v| v.empty_dir.is_some()))
}
