use crate::PipelineError;
use chrono::{DateTime, Utc};
use grok_core::collaborators::MentionSource;
use grok_storage::MentionStore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestorConfig {
    pub max_pages: usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self { max_pages: 1 }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestTickReport {
    pub pages_fetched: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Set when the source failed mid-tick; rows inserted before it stay valid.
    pub fetch_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    config: IngestorConfig,
}

impl Ingestor {
    pub fn new(config: IngestorConfig) -> Self {
        Self { config }
    }

    pub async fn run_once(
        &self,
        store: &MentionStore,
        source: &dyn MentionSource,
        now: DateTime<Utc>,
    ) -> Result<IngestTickReport, PipelineError> {
        let mut report = IngestTickReport::default();
        let mut cursor: Option<String> = None;

        for _ in 0..self.config.max_pages.max(1) {
            let page = match source.list_recent_mentions(cursor.as_deref()).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(event = "ingest_fetch_failed", error = %err, pages = report.pages_fetched);
                    report.fetch_error = Some(err.to_string());
                    break;
                }
            };

            report.pages_fetched += 1;
            report.fetched += page.mentions.len();
            if page.mentions.is_empty() {
                break;
            }

            let mut inserted_on_page = 0;
            for mention in &page.mentions {
                if store.insert_if_absent(mention, now)? {
                    inserted_on_page += 1;
                    info!(
                        event = "mention_ingested",
                        mention_id = %mention.id,
                        author = %mention.author
                    );
                } else {
                    report.duplicates += 1;
                }
            }
            report.inserted += inserted_on_page;

            // A page with nothing new means the older pages were seen before.
            if inserted_on_page == 0 {
                debug!(event = "ingest_caught_up", pages = report.pages_fetched);
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use grok_core::collaborators::{CollaboratorError, MentionPage};
    use grok_core::mention_contracts::{MentionContext, NewMention};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn mention(id: &str) -> NewMention {
        NewMention {
            id: id.to_string(),
            author: "alice".to_string(),
            author_id: "111".to_string(),
            content: "@grok hi".to_string(),
            context: MentionContext::new("reply", "42"),
            source_ts: ts(),
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> Result<MentionPage, CollaboratorError> {
        Ok(MentionPage {
            mentions: ids.iter().map(|id| mention(id)).collect(),
            next_cursor: next.map(str::to_string),
        })
    }

    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<MentionPage, CollaboratorError>>>,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<MentionPage, CollaboratorError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MentionSource for ScriptedSource {
        async fn list_recent_mentions(
            &self,
            cursor: Option<&str>,
        ) -> Result<MentionPage, CollaboratorError> {
            self.cursors
                .lock()
                .expect("cursors")
                .push(cursor.map(str::to_string));
            self.pages
                .lock()
                .expect("pages")
                .pop_front()
                .unwrap_or_else(|| page(&[], None))
        }
    }

    #[tokio::test]
    async fn inserts_new_mentions_and_counts_duplicates() {
        let store = MentionStore::open_in_memory().expect("db");
        store.insert_if_absent(&mention("old"), ts()).expect("seed");
        let source = ScriptedSource::new(vec![page(&["new-1", "new-2", "old"], None)]);

        let report = Ingestor::new(IngestorConfig::default())
            .run_once(&store, &source, ts())
            .await
            .expect("tick");

        assert_eq!(report.fetched, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.fetch_error, None);
        assert_eq!(store.counts_by_status().expect("counts").total(), 3);
    }

    #[tokio::test]
    async fn follows_cursor_until_a_page_has_nothing_new() {
        let store = MentionStore::open_in_memory().expect("db");
        store.insert_if_absent(&mention("c"), ts()).expect("seed");
        let source = ScriptedSource::new(vec![
            page(&["a"], Some("cur-1")),
            page(&["b"], Some("cur-2")),
            page(&["c"], Some("cur-3")),
            page(&["d"], None),
        ]);

        let report = Ingestor::new(IngestorConfig { max_pages: 10 })
            .run_once(&store, &source, ts())
            .await
            .expect("tick");

        assert_eq!(report.pages_fetched, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(
            *source.cursors.lock().expect("cursors"),
            vec![None, Some("cur-1".to_string()), Some("cur-2".to_string())]
        );
        assert!(store.mention("d").expect("query").is_none());
    }

    #[tokio::test]
    async fn fetch_failure_abandons_tick_but_keeps_earlier_pages() {
        let store = MentionStore::open_in_memory().expect("db");
        let source = ScriptedSource::new(vec![
            page(&["a", "b"], Some("cur-1")),
            Err(CollaboratorError::transient("connection reset")),
        ]);

        let report = Ingestor::new(IngestorConfig { max_pages: 5 })
            .run_once(&store, &source, ts())
            .await
            .expect("tick survives fetch errors");

        assert_eq!(report.inserted, 2);
        assert!(report
            .fetch_error
            .as_deref()
            .expect("error recorded")
            .contains("connection reset"));
        assert_eq!(store.counts_by_status().expect("counts").total(), 2);
    }
}
