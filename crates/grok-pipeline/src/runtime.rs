use crate::ingestor::Ingestor;
use crate::processor::Processor;
use crate::reaper::Reaper;
use crate::status::LoopHeartbeat;
use crate::PipelineError;
use chrono::Utc;
use grok_core::collaborators::{MentionSource, ReplyGenerator, ReplyPoster};
use grok_storage::MentionStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Outcome of one tick as seen by the loop driver.
enum Tick {
    Ok,
    Degraded(String),
}

/// Runs `tick` immediately and then every `interval` until `cancel` fires.
/// A tick error is fatal: the heartbeat is marked failed and the error returned.
async fn drive<F, Fut>(
    name: &'static str,
    interval: Duration,
    heartbeat: LoopHeartbeat,
    cancel: CancellationToken,
    mut tick: F,
) -> Result<(), PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Tick, PipelineError>>,
{
    info!(event = "loop_start", loop_name = name, interval_ms = interval.as_millis() as u64);
    loop {
        match tick().await {
            Ok(Tick::Ok) => heartbeat.tick_ok(Utc::now()),
            Ok(Tick::Degraded(reason)) => heartbeat.tick_degraded(Utc::now(), reason),
            Err(err) => {
                error!(event = "loop_failed", loop_name = name, error = %err);
                heartbeat.failed(Utc::now(), err.to_string());
                return Err(err);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    heartbeat.stopped();
    info!(event = "loop_stop", loop_name = name);
    Ok(())
}

pub async fn run_ingest_loop(
    ingestor: Ingestor,
    store: Arc<MentionStore>,
    source: Arc<dyn MentionSource>,
    interval: Duration,
    heartbeat: LoopHeartbeat,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    drive("ingestor", interval, heartbeat, cancel, || {
        let ingestor = ingestor.clone();
        let store = store.clone();
        let source = source.clone();
        async move {
            let report = ingestor.run_once(&store, source.as_ref(), Utc::now()).await?;
            debug!(
                event = "ingest_tick",
                fetched = report.fetched,
                inserted = report.inserted,
                duplicates = report.duplicates
            );
            Ok(match report.fetch_error {
                Some(err) => Tick::Degraded(err),
                None => Tick::Ok,
            })
        }
    })
    .await
}

pub async fn run_process_loop(
    processor: Arc<Processor>,
    store: Arc<MentionStore>,
    generator: Arc<dyn ReplyGenerator>,
    poster: Arc<dyn ReplyPoster>,
    interval: Duration,
    heartbeat: LoopHeartbeat,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let tick_cancel = cancel.clone();
    drive("processor", interval, heartbeat, cancel, || {
        let processor = processor.clone();
        let store = store.clone();
        let generator = generator.clone();
        let poster = poster.clone();
        let cancel = tick_cancel.clone();
        async move {
            let report = processor
                .run_once(&store, generator.as_ref(), poster.as_ref(), &cancel)
                .await?;
            if report.claimed > 0 {
                info!(
                    event = "process_tick",
                    claimed = report.claimed,
                    replied = report.replied,
                    retried = report.retried,
                    failed = report.failed,
                    skipped = report.skipped
                );
            }
            Ok(Tick::Ok)
        }
    })
    .await
}

pub async fn run_reaper_loop(
    reaper: Reaper,
    store: Arc<MentionStore>,
    interval: Duration,
    heartbeat: LoopHeartbeat,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    drive("reaper", interval, heartbeat, cancel, || {
        let reaper = reaper.clone();
        let store = store.clone();
        async move {
            // The reclaim can wait on the SQLite busy timeout; keep it off the async workers.
            tokio::task::spawn_blocking(move || reaper.run_once(&store, Utc::now())).await??;
            Ok(Tick::Ok)
        }
    })
    .await
}
