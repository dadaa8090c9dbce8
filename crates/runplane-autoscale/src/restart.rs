//! Restart bookkeeping for pods whose agent never registered.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Limits applied to unhealthy-pod restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// How long a new pod may run without an agent before it is suspect.
    pub grace_period: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts before giving up and asking for an operator.
    pub max_restarts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2 * 60),
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(10 * 60),
            max_restarts: 5,
        }
    }
}

impl RestartPolicy {
    /// Wait required after `restarts` previous attempts: 0, 1m, 2m, 4m, 8m, 10m...
    pub fn backoff(&self, restarts: u32) -> Duration {
        if restarts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(restarts - 1).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartInfo {
    pub restart_count: u32,
    pub last_restart_at: Option<u64>,
    pub first_unhealthy_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { attempt: u32 },
    Backoff { remaining: Duration },
    GiveUp { restart_count: u32, first_unhealthy_at: u64 },
}

/// Per-pool restart history, keyed by pod name.
///
/// A restart replaces the pod, so its history moves to the replacement's
/// name and keeps counting.
#[derive(Debug, Default)]
pub struct RestartTracker {
    policy: RestartPolicy,
    pods: HashMap<String, RestartInfo>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            pods: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn get(&self, pod_name: &str) -> Option<&RestartInfo> {
        self.pods.get(pod_name)
    }

    /// Decide what to do with an unhealthy pod at `now`.
    pub fn decide(&mut self, pod_name: &str, now: u64) -> RestartDecision {
        let info = self
            .pods
            .entry(pod_name.to_string())
            .or_insert(RestartInfo {
                restart_count: 0,
                last_restart_at: None,
                first_unhealthy_at: now,
            });

        if info.restart_count >= self.policy.max_restarts {
            return RestartDecision::GiveUp {
                restart_count: info.restart_count,
                first_unhealthy_at: info.first_unhealthy_at,
            };
        }

        let wait = self.policy.backoff(info.restart_count).as_secs();
        if let Some(last) = info.last_restart_at {
            let elapsed = now.saturating_sub(last);
            if elapsed < wait {
                return RestartDecision::Backoff {
                    remaining: Duration::from_secs(wait - elapsed),
                };
            }
        }
        RestartDecision::Restart {
            attempt: info.restart_count + 1,
        }
    }

    /// Record that `old_pod` was restarted, as `new_pod` if it was replaced.
    pub fn record_restart(&mut self, old_pod: &str, new_pod: Option<&str>, now: u64) -> RestartInfo {
        let mut info = self.pods.remove(old_pod).unwrap_or(RestartInfo {
            restart_count: 0,
            last_restart_at: None,
            first_unhealthy_at: now,
        });
        info.restart_count += 1;
        info.last_restart_at = Some(now);
        self.pods
            .insert(new_pod.unwrap_or(old_pod).to_string(), info);
        info
    }

    /// Forget pods that no longer exist.
    pub fn retain_pods<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) {
        let live: HashSet<&str> = live.into_iter().collect();
        self.pods.retain(|name, _| live.contains(name.as_str()));
    }

    pub fn clear(&mut self) {
        self.pods.clear();
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}
