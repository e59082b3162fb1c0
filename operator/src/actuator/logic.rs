//! Pure node-mutation logic, factored out of [`super::NodeActuator`] so it
//! is unit-testable without a live `kube::Client`.

use k8s_openapi::api::core::v1::Taint;

/// AddTaint: no-op if the key is already present (first-writer-wins on
/// value). Returns the new taint list and whether it actually changed.
pub fn add_taint(mut existing: Vec<Taint>, key: &str, value: &str, effect: &str) -> (Vec<Taint>, bool) {
    if existing.iter().any(|t| t.key == key) {
        return (existing, false);
    }
    existing.push(Taint {
        key: key.to_string(),
        value: Some(value.to_string()),
        effect: effect.to_string(),
        time_added: None,
    });
    (existing, true)
}

/// RemoveNTHTaints: remove only the keys this system owns. No-op if none
/// of `owned_keys` are present.
pub fn remove_taints(existing: Vec<Taint>, owned_keys: &[&str]) -> (Vec<Taint>, bool) {
    let before = existing.len();
    let kept: Vec<Taint> = existing
        .into_iter()
        .filter(|t| !owned_keys.contains(&t.key.as_str()))
        .collect();
    let changed = kept.len() != before;
    (kept, changed)
}

/// Reboot-resume decision rule: compare `now - action_time` against the
/// node's system uptime.
/// Strictly less means wall-clock elapsed since we wrote the label is
/// shorter than how long the machine has been up -- i.e. the machine
/// rebooted since we set the label.
pub fn has_rebooted_since_marked(now_unix: i64, action_time_unix: i64, uptime_secs: u64) -> bool {
    let elapsed = now_unix - action_time_unix;
    elapsed >= 0 && elapsed < uptime_secs as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: Some("v".to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        }
    }

    #[test]
    fn add_taint_is_idempotent() {
        let (taints, changed) = add_taint(vec![], "spot-itn", "abc", "NoSchedule");
        assert!(changed);
        assert_eq!(taints.len(), 1);

        let (taints2, changed2) = add_taint(taints, "spot-itn", "different-value", "NoSchedule");
        assert!(!changed2, "re-applying the same key is a no-op");
        assert_eq!(taints2[0].value.as_deref(), Some("abc"), "first writer wins");
    }

    #[test]
    fn remove_absent_taint_is_noop() {
        let (taints, changed) = remove_taints(vec![taint("other")], &["spot-itn"]);
        assert!(!changed);
        assert_eq!(taints.len(), 1);
    }

    #[test]
    fn remove_owned_taint_only() {
        let (taints, changed) = remove_taints(vec![taint("spot-itn"), taint("someone-elses")], &["spot-itn"]);
        assert!(changed);
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].key, "someone-elses");
    }

    #[test]
    fn reboot_resume_fires_when_elapsed_less_than_uptime() {
        // Label was written 100s ago (action_time = now-100); if the
        // machine has been up for 500s, it must have rebooted since.
        let now = 1_700_000_000_i64;
        assert!(has_rebooted_since_marked(now, now - 100, 500));
    }

    #[test]
    fn reboot_resume_does_not_fire_without_reboot() {
        // Label written 1000s ago but uptime is only 50s -> no reboot yet
        // relative to the label (uptime shorter than elapsed is the
        // "hasn't rebooted" case... wait: elapsed(1000) >= uptime(50) so
        // does not fire).
        let now = 1_700_000_000_i64;
        assert!(!has_rebooted_since_marked(now, now - 1000, 50));
    }
}
