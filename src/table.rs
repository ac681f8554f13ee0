//! Service table: the one shared structure. Keyed by service name, guarded
//! by a reader/writer lock, never structurally mutated after startup.
//! Reads hand out snapshots, not aliases.

use crate::config::{Config, Service};
use crate::output::OutputCapture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restarts: u32,
}

impl ServiceStatus {
    fn stopped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: false,
            pid: None,
            start_time: None,
            restarts: 0,
        }
    }
}

/// Pid of a live child. The monitor task owns the `Child` itself; signal
/// delivery only needs the pid.
#[derive(Debug, Clone, Copy)]
pub struct LiveHandle {
    pub pid: i32,
}

struct Entry {
    service: Service,
    status: ServiceStatus,
    handle: Option<LiveHandle>,
    capture: Option<OutputCapture>,
}

pub struct ServiceTable {
    inner: RwLock<BTreeMap<String, Entry>>,
}

impl ServiceTable {
    pub fn new(config: &Config) -> Self {
        let mut entries = BTreeMap::new();
        for (name, svc) in &config.services {
            entries.insert(
                name.clone(),
                Entry {
                    service: svc.clone(),
                    status: ServiceStatus::stopped(name),
                    handle: None,
                    capture: None,
                },
            );
        }
        Self {
            inner: RwLock::new(entries),
        }
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.get(name).map(|e| e.service.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.contains_key(name)
    }

    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.get(name).map(|e| e.status.clone())
    }

    pub fn statuses(&self) -> BTreeMap<String, ServiceStatus> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.iter()
            .map(|(name, e)| (name.clone(), e.status.clone()))
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.get(name).is_some_and(|e| e.handle.is_some())
    }

    /// Pid of a live child, if the service is running.
    pub fn running_pid(&self, name: &str) -> Option<i32> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.get(name).and_then(|e| e.handle.map(|h| h.pid))
    }

    /// Snapshot of all live children as (name, pid) pairs.
    pub fn running_children(&self) -> Vec<(String, i32)> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.iter()
            .filter_map(|(name, e)| e.handle.map(|h| (name.clone(), h.pid)))
            .collect()
    }

    /// Record a successful spawn. Restart counters are the monitor's
    /// business and stay untouched here.
    pub fn mark_started(&self, name: &str, pid: i32, capture: Option<OutputCapture>) {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(e) = g.get_mut(name) {
            e.handle = Some(LiveHandle { pid });
            e.capture = capture;
            e.status.running = true;
            e.status.pid = Some(pid);
            e.status.start_time = Some(Utc::now());
        }
    }

    /// Record an exit. Pid and start time survive for post-mortem
    /// inspection until the next spawn. Returns the capture so the caller
    /// can stop it outside the lock.
    pub fn mark_stopped(&self, name: &str) -> Option<OutputCapture> {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let e = g.get_mut(name)?;
        e.handle = None;
        e.status.running = false;
        e.capture.take()
    }

    pub fn restarts(&self, name: &str) -> u32 {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        g.get(name).map(|e| e.status.restarts).unwrap_or(0)
    }

    pub fn increment_restarts(&self, name: &str) -> u32 {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        match g.get_mut(name) {
            Some(e) => {
                e.status.restarts = e.status.restarts.saturating_add(1);
                e.status.restarts
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;

    fn test_config() -> Config {
        let yaml = r#"
version: "1.0"
services:
  alpha:
    command: ["true"]
    user: nobody
    group: nobody
  beta:
    command: ["true"]
    restart: always
"#;
        serde_yaml::from_str::<Config>(yaml)
            .map(|mut c| {
                for (name, svc) in c.services.iter_mut() {
                    svc.name = name.clone();
                }
                c
            })
            .unwrap()
    }

    #[test]
    fn running_flag_tracks_live_handle() {
        let table = ServiceTable::new(&test_config());
        assert!(!table.is_running("alpha"));
        assert_eq!(table.status("alpha").unwrap().pid, None);

        table.mark_started("alpha", 4242, None);
        assert!(table.is_running("alpha"));
        let st = table.status("alpha").unwrap();
        assert!(st.running);
        assert_eq!(st.pid, Some(4242));
        assert!(st.start_time.is_some());

        table.mark_stopped("alpha");
        assert!(!table.is_running("alpha"));
        let st = table.status("alpha").unwrap();
        assert!(!st.running);
        // Post-mortem fields survive until the next spawn.
        assert_eq!(st.pid, Some(4242));
        assert!(st.start_time.is_some());
    }

    #[test]
    fn snapshots_do_not_alias_live_state() {
        let table = ServiceTable::new(&test_config());
        let before = table.statuses();
        table.mark_started("beta", 7, None);
        assert!(!before["beta"].running);
        assert!(table.statuses()["beta"].running);
    }

    #[test]
    fn restart_counter_is_monotonic() {
        let table = ServiceTable::new(&test_config());
        assert_eq!(table.restarts("beta"), 0);
        assert_eq!(table.increment_restarts("beta"), 1);
        assert_eq!(table.increment_restarts("beta"), 2);
        assert_eq!(table.restarts("beta"), 2);
        assert_eq!(table.increment_restarts("missing"), 0);
    }

    #[test]
    fn running_children_snapshot() {
        let table = ServiceTable::new(&test_config());
        table.mark_started("alpha", 10, None);
        table.mark_started("beta", 11, None);
        let mut live = table.running_children();
        live.sort();
        assert_eq!(live, vec![("alpha".into(), 10), ("beta".into(), 11)]);
        assert_eq!(table.service("beta").unwrap().restart, RestartPolicy::Always);
    }
}
