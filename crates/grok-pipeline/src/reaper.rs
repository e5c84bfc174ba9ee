use crate::PipelineError;
use chrono::{DateTime, Duration, Utc};
use grok_storage::MentionStore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    pub processing_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::minutes(20),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaperTickReport {
    pub requeued: usize,
    pub exhausted: usize,
}

/// Returns claims abandoned by a crashed or cancelled processor to the queue.
#[derive(Debug, Clone)]
pub struct Reaper {
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(config: ReaperConfig) -> Self {
        Self { config }
    }

    pub fn processing_timeout(&self) -> Duration {
        self.config.processing_timeout
    }

    pub fn run_once(
        &self,
        store: &MentionStore,
        now: DateTime<Utc>,
    ) -> Result<ReaperTickReport, PipelineError> {
        let reclaimed = store.reclaim_timed_out(self.config.processing_timeout, now)?;
        if reclaimed.total() > 0 {
            warn!(
                event = "claims_reclaimed",
                requeued = reclaimed.requeued,
                exhausted = reclaimed.exhausted,
                timeout_minutes = self.config.processing_timeout.num_minutes()
            );
        } else {
            debug!(event = "reaper_idle");
        }
        Ok(ReaperTickReport {
            requeued: reclaimed.requeued,
            exhausted: reclaimed.exhausted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
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
    fn requeues_only_claims_older_than_the_timeout() {
        let store = MentionStore::open_in_memory().expect("db");
        seed(&store, "stale");
        store
            .claim_batch(1, Duration::minutes(20), ts(0))
            .expect("claim stale");
        seed(&store, "fresh");
        store
            .claim_batch(1, Duration::minutes(20), ts(15))
            .expect("claim fresh");

        let reaper = Reaper::new(ReaperConfig::default());
        let report = reaper.run_once(&store, ts(25)).expect("reap");

        assert_eq!(
            report,
            ReaperTickReport {
                requeued: 1,
                exhausted: 0
            }
        );
        let stale = store.mention("stale").expect("query").expect("present");
        assert_eq!(stale.status, MentionStatus::Pending);
        assert_eq!(stale.attempt_count, 1);
        assert!(stale.claimed_at.is_none());
        let fresh = store.mention("fresh").expect("query").expect("present");
        assert_eq!(fresh.status, MentionStatus::Processing);
    }

    #[test]
    fn idle_store_reports_nothing() {
        let store = MentionStore::open_in_memory().expect("db");
        let report = Reaper::new(ReaperConfig::default())
            .run_once(&store, ts(30))
            .expect("reap");
        assert_eq!(report, ReaperTickReport::default());
    }
}
