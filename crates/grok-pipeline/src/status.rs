use chrono::{DateTime, SecondsFormat, Utc};
use grok_core::mention_contracts::StatusCounts;
use grok_storage::MentionStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Starting,
            ticks: 0,
            last_tick_at: None,
            last_success_at: None,
            last_error: None,
        }
    }
}

/// Handle a loop uses to report its own liveness.
#[derive(Debug, Clone, Default)]
pub struct LoopHeartbeat {
    inner: Arc<Mutex<LoopStatus>>,
}

impl LoopHeartbeat {
    // A panicking writer only leaves a stale snapshot behind.
    fn lock(&self) -> MutexGuard<'_, LoopStatus> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tick_ok(&self, now: DateTime<Utc>) {
        let mut status = self.lock();
        status.state = LoopState::Running;
        status.ticks += 1;
        status.last_tick_at = Some(now);
        status.last_success_at = Some(now);
        status.last_error = None;
    }

    /// A tick that hit a recoverable problem; the loop keeps going.
    pub fn tick_degraded(&self, now: DateTime<Utc>, error: impl Into<String>) {
        let mut status = self.lock();
        status.state = LoopState::Running;
        status.ticks += 1;
        status.last_tick_at = Some(now);
        status.last_error = Some(error.into());
    }

    pub fn failed(&self, now: DateTime<Utc>, error: impl Into<String>) {
        let mut status = self.lock();
        status.state = LoopState::Failed;
        status.last_tick_at = Some(now);
        status.last_error = Some(error.into());
    }

    pub fn stopped(&self) {
        let mut status = self.lock();
        if status.state != LoopState::Failed {
            status.state = LoopState::Stopped;
        }
    }

    pub fn status(&self) -> LoopStatus {
        self.lock().clone()
    }
}

/// Health probe for something outside the loops, such as session credentials.
pub type ComponentCheck = Arc<dyn Fn(DateTime<Utc>) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub healthy: bool,
    pub timestamp: String,
    pub uptime_seconds: i64,
    pub counts: StatusCounts,
    pub overdue_claims: u64,
    pub loops: BTreeMap<String, LoopStatus>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

/// Read-only view over the store and the registered loops.
pub struct StatusReporter {
    store: Arc<MentionStore>,
    loops: Mutex<BTreeMap<String, LoopHeartbeat>>,
    components: Mutex<BTreeMap<String, ComponentCheck>>,
    started_at: DateTime<Utc>,
}

impl StatusReporter {
    pub fn new(store: Arc<MentionStore>, started_at: DateTime<Utc>) -> Self {
        Self {
            store,
            loops: Mutex::new(BTreeMap::new()),
            components: Mutex::new(BTreeMap::new()),
            started_at,
        }
    }

    pub fn register(&self, name: &str) -> LoopHeartbeat {
        let heartbeat = LoopHeartbeat::default();
        self.loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), heartbeat.clone());
        heartbeat
    }

    pub fn register_component<F>(&self, name: &str, check: F)
    where
        F: Fn(DateTime<Utc>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.components
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), Arc::new(check));
    }

    /// Healthy while the store answers, no registered loop has failed and every
    /// component check passes.
    pub fn snapshot(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let loops = self
            .loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, heartbeat)| (name.clone(), heartbeat.status()))
            .collect::<BTreeMap<_, _>>();

        let store_result = self
            .store
            .counts_by_status()
            .and_then(|counts| Ok((counts, self.store.overdue_claims(now)?)));
        let (counts, overdue_claims, store_error) = match store_result {
            Ok((counts, overdue)) => (counts, overdue, None),
            Err(err) => (StatusCounts::default(), 0, Some(err.to_string())),
        };

        let checks = self
            .components
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, check)| (name.clone(), check.clone()))
            .collect::<Vec<_>>();
        let components = checks
            .into_iter()
            .map(|(name, check)| {
                let status = match check(now) {
                    Ok(()) => ComponentStatus {
                        healthy: true,
                        detail: None,
                    },
                    Err(detail) => ComponentStatus {
                        healthy: false,
                        detail: Some(detail),
                    },
                };
                (name, status)
            })
            .collect::<BTreeMap<_, _>>();

        let loops_ok = loops
            .values()
            .all(|status| status.state != LoopState::Failed);
        let components_ok = components.values().all(|status| status.healthy);

        StatusSnapshot {
            healthy: store_error.is_none() && loops_ok && components_ok,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            uptime_seconds: (now - self.started_at).num_seconds().max(0),
            counts,
            overdue_claims,
            loops,
            components,
            store_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use grok_core::mention_contracts::{MentionContext, NewMention};
    use grok_core::MentionStatus;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn seed(store: &MentionStore, id: &str) {
        store
            .insert_if_absent(
                &NewMention {
                    id: id.to_string(),
                    author: "alice".to_string(),
                    author_id: "111".to_string(),
                    content: "@grok hi".to_string(),
                    context: MentionContext::new("reply", "42"),
                    source_ts: ts(0),
                },
                ts(0),
            )
            .expect("seed");
    }

    #[test]
    fn snapshot_reports_counts_overdue_claims_and_uptime() {
        let store = Arc::new(MentionStore::open_in_memory().expect("db"));
        seed(&store, "a");
        seed(&store, "b");
        store
            .claim_batch(1, Duration::minutes(5), ts(0))
            .expect("claim");

        let reporter = StatusReporter::new(store, ts(0));
        let ingest = reporter.register("ingestor");
        ingest.tick_ok(ts(9));

        let snapshot = reporter.snapshot(ts(10));
        assert!(snapshot.healthy);
        assert_eq!(snapshot.uptime_seconds, 600);
        assert_eq!(snapshot.timestamp, "2026-02-23T14:10:00Z");
        assert_eq!(snapshot.counts.get(MentionStatus::Pending), 1);
        assert_eq!(snapshot.counts.get(MentionStatus::Processing), 1);
        assert_eq!(snapshot.counts.get(MentionStatus::Failed), 0);
        assert_eq!(snapshot.overdue_claims, 1);
        assert_eq!(snapshot.loops["ingestor"].ticks, 1);
        assert_eq!(snapshot.loops["ingestor"].state, LoopState::Running);
    }

    #[test]
    fn failed_loop_makes_snapshot_unhealthy() {
        let store = Arc::new(MentionStore::open_in_memory().expect("db"));
        let reporter = StatusReporter::new(store, ts(0));
        let processor = reporter.register("processor");
        let reaper = reporter.register("reaper");

        processor.failed(ts(1), "storage error: disk I/O error");
        reaper.stopped();
        processor.stopped();

        let snapshot = reporter.snapshot(ts(2));
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.loops["processor"].state, LoopState::Failed);
        assert_eq!(snapshot.loops["reaper"].state, LoopState::Stopped);
    }

    #[test]
    fn failing_component_check_makes_snapshot_unhealthy() {
        let store = Arc::new(MentionStore::open_in_memory().expect("db"));
        let reporter = StatusReporter::new(store, ts(0));
        let expires_at = ts(30);
        reporter.register_component("credentials", move |now| {
            if now >= expires_at {
                Err("credentials expired".to_string())
            } else {
                Ok(())
            }
        });

        let before = reporter.snapshot(ts(10));
        assert!(before.healthy);
        assert!(before.components["credentials"].healthy);

        let after = reporter.snapshot(ts(31));
        assert!(!after.healthy);
        assert_eq!(
            after.components["credentials"].detail.as_deref(),
            Some("credentials expired")
        );
        let json = serde_json::to_value(&after).expect("json");
        assert_eq!(json["components"]["credentials"]["healthy"], false);
    }

    #[test]
    fn degraded_tick_keeps_last_success() {
        let heartbeat = LoopHeartbeat::default();
        heartbeat.tick_ok(ts(1));
        heartbeat.tick_degraded(ts(2), "fetch failed");

        let status = heartbeat.status();
        assert_eq!(status.ticks, 2);
        assert_eq!(status.last_success_at, Some(ts(1)));
        assert_eq!(status.last_tick_at, Some(ts(2)));
        assert_eq!(status.last_error.as_deref(), Some("fetch failed"));
    }

    #[test]
    fn snapshot_serializes_zero_filled_counts() {
        let store = Arc::new(MentionStore::open_in_memory().expect("db"));
        let reporter = StatusReporter::new(store, ts(0));
        let json = serde_json::to_value(reporter.snapshot(ts(0))).expect("json");
        assert_eq!(json["counts"]["pending"], 0);
        assert_eq!(json["counts"]["replied"], 0);
        assert!(json.get("store_error").is_none());
    }
}
