use crate::policy::{MentionPolicy, PolicyDecision};
use crate::throttle::PostThrottle;
use crate::PipelineError;
use chrono::Utc;
use grok_core::collaborators::{
    CollaboratorError, ContextFetcher, ReplyGenerator, ReplyPoster, ThreadContext,
};
use grok_core::mention_contracts::Mention;
use grok_core::MentionStatus;
use grok_storage::{MentionStore, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    /// Lease stamped on each claim; matches the reaper's timeout.
    pub claim_window: chrono::Duration,
    pub generation_timeout: Duration,
    pub policy: MentionPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            claim_window: chrono::Duration::minutes(20),
            generation_timeout: Duration::from_secs(60),
            policy: MentionPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessTickReport {
    pub claimed: usize,
    pub replied: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Claimed but left untouched because shutdown was requested.
    pub abandoned: usize,
    /// Reclaimed by the reaper while still in flight; the outcome was dropped.
    pub lost: usize,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Generate,
    Post,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Generate => "generate",
            Stage::Post => "post",
        }
    }
}

pub struct Processor {
    config: ProcessorConfig,
    throttle: Arc<PostThrottle>,
    context_fetcher: Option<Arc<dyn ContextFetcher>>,
}

impl Processor {
    pub fn new(config: ProcessorConfig, throttle: Arc<PostThrottle>) -> Self {
        Self {
            config,
            throttle,
            context_fetcher: None,
        }
    }

    pub fn with_context_fetcher(mut self, fetcher: Arc<dyn ContextFetcher>) -> Self {
        self.context_fetcher = Some(fetcher);
        self
    }

    /// One cycle: claim a batch, then handle each mention in order. A
    /// collaborator failure only affects its own mention; a store failure ends
    /// the cycle and is returned.
    pub async fn run_once(
        &self,
        store: &MentionStore,
        generator: &dyn ReplyGenerator,
        poster: &dyn ReplyPoster,
        cancel: &CancellationToken,
    ) -> Result<ProcessTickReport, PipelineError> {
        let claimed = store.claim_batch(
            self.config.batch_size,
            self.config.claim_window,
            Utc::now(),
        )?;
        let mut report = ProcessTickReport {
            claimed: claimed.len(),
            ..ProcessTickReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        info!(event = "batch_claimed", count = claimed.len());

        for (index, mention) in claimed.iter().enumerate() {
            if cancel.is_cancelled() {
                report.abandoned = claimed.len() - index;
                warn!(
                    event = "batch_abandoned",
                    remaining = report.abandoned,
                    "shutdown requested; remaining claims are left to the reaper"
                );
                break;
            }
            self.handle_mention(store, generator, poster, mention, &mut report)
                .await?;
        }

        Ok(report)
    }

    async fn handle_mention(
        &self,
        store: &MentionStore,
        generator: &dyn ReplyGenerator,
        poster: &dyn ReplyPoster,
        mention: &Mention,
        report: &mut ProcessTickReport,
    ) -> Result<(), PipelineError> {
        let mut request = match self.config.policy.evaluate(mention) {
            PolicyDecision::Reply(request) => request,
            PolicyDecision::Skip(reason) => {
                let outcome = store.mark_skipped(&mention.id, &reason, Utc::now());
                if settle(mention, outcome, report)?.is_some() {
                    report.skipped += 1;
                    info!(event = "mention_skipped", mention_id = %mention.id, reason = %reason);
                }
                return Ok(());
            }
        };

        if !claim_still_held(store, mention, report)? {
            return Ok(());
        }
        if let Some(fetcher) = &self.context_fetcher {
            request.thread = self.fetch_thread(fetcher.as_ref(), mention).await;
        }

        let generated = tokio::time::timeout(
            self.config.generation_timeout,
            generator.generate_reply(&request),
        )
        .await
        .unwrap_or_else(|_| {
            Err(CollaboratorError::transient(format!(
                "generation timed out after {}s",
                self.config.generation_timeout.as_secs()
            )))
        })
        .and_then(|text| {
            let text = text.trim().to_string();
            if text.is_empty() {
                Err(CollaboratorError::transient("generator returned an empty reply"))
            } else {
                Ok(text)
            }
        });
        let reply = match generated {
            Ok(reply) => reply,
            Err(err) => return self.record_failure(store, mention, Stage::Generate, err, report),
        };

        let permit = self.throttle.acquire().await;
        if !claim_still_held(store, mention, report)? {
            return Ok(());
        }
        match poster.post_reply(mention, &reply).await {
            Ok(posted) => {
                permit.record_success();
                let outcome = store.mark_replied(&mention.id, &reply, Utc::now());
                if settle(mention, outcome, report)?.is_none() {
                    return Ok(());
                }
                report.replied += 1;
                info!(
                    event = "mention_replied",
                    mention_id = %mention.id,
                    attempt = mention.attempt_count,
                    remote_id = posted.remote_id.as_deref().unwrap_or("-")
                );
                Ok(())
            }
            Err(err) => {
                drop(permit);
                self.record_failure(store, mention, Stage::Post, err, report)
            }
        }
    }

    /// Missing context only makes the reply less informed, so any failure here
    /// degrades to an empty context.
    async fn fetch_thread(&self, fetcher: &dyn ContextFetcher, mention: &Mention) -> ThreadContext {
        match tokio::time::timeout(
            self.config.generation_timeout,
            fetcher.fetch_context(mention),
        )
        .await
        {
            Ok(Ok(thread)) => thread,
            Ok(Err(err)) => {
                warn!(event = "context_unavailable", mention_id = %mention.id, error = %err);
                ThreadContext::default()
            }
            Err(_) => {
                warn!(
                    event = "context_unavailable",
                    mention_id = %mention.id,
                    error = "context fetch timed out"
                );
                ThreadContext::default()
            }
        }
    }

    fn record_failure(
        &self,
        store: &MentionStore,
        mention: &Mention,
        stage: Stage,
        err: CollaboratorError,
        report: &mut ProcessTickReport,
    ) -> Result<(), PipelineError> {
        let message = format!("{}: {}", stage.as_str(), err);
        if err.is_permanent() {
            let outcome = store.mark_skipped(&mention.id, &message, Utc::now());
            if settle(mention, outcome, report)?.is_some() {
                report.skipped += 1;
                warn!(event = "mention_rejected", mention_id = %mention.id, error = %message);
            }
            return Ok(());
        }

        let outcome = store.mark_retry(&mention.id, &message, Utc::now());
        match settle(mention, outcome, report)? {
            None => {}
            Some(MentionStatus::Failed) => {
                report.failed += 1;
                warn!(
                    event = "mention_failed",
                    mention_id = %mention.id,
                    attempts = mention.attempt_count,
                    error = %message
                );
            }
            Some(_) => {
                report.retried += 1;
                warn!(
                    event = "mention_retry",
                    mention_id = %mention.id,
                    attempt = mention.attempt_count,
                    error = %message
                );
            }
        }
        Ok(())
    }
}

/// The claim is ours while its lease is running and the row still carries our
/// `claimed_at`. Once either fails, the reaper may hand the mention to another
/// cycle, so nothing more is sent for it here.
fn claim_still_held(
    store: &MentionStore,
    mention: &Mention,
    report: &mut ProcessTickReport,
) -> Result<bool, PipelineError> {
    let now = Utc::now();
    let lease_running = mention
        .lease_expires_at
        .is_some_and(|lease_expires_at| now < lease_expires_at);
    let row_held = lease_running
        && store.mention(&mention.id)?.is_some_and(|current| {
            current.status == MentionStatus::Processing && current.claimed_at == mention.claimed_at
        });
    if !row_held {
        report.lost += 1;
        warn!(
            event = "claim_lost",
            mention_id = %mention.id,
            lease_expires_at = ?mention.lease_expires_at,
            "claim expired before the reply was sent"
        );
    }
    Ok(row_held)
}

/// A transition refused because the row is no longer `processing` means the
/// reaper took the claim back; that mention is dropped, the batch goes on.
fn settle<T>(
    mention: &Mention,
    outcome: Result<T, StorageError>,
    report: &mut ProcessTickReport,
) -> Result<Option<T>, PipelineError> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(StorageError::InvalidState { from, .. }) => {
            report.lost += 1;
            warn!(event = "claim_lost", mention_id = %mention.id, status = %from);
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}
