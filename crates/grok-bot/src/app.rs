use crate::bilibili::BilibiliClient;
use crate::config::{worst_case_batch_seconds, Config, StorageConfig};
use crate::credentials::Credentials;
use crate::health;
use crate::llm::ChatCompletionsGenerator;
use anyhow::Context;
use chrono::Utc;
use grok_core::collaborators::{ContextFetcher, MentionSource, ReplyGenerator, ReplyPoster};
use grok_pipeline::{
    run_ingest_loop, run_process_loop, run_reaper_loop, Ingestor, IngestorConfig, MentionPolicy,
    PipelineError, PostThrottle, Processor, ProcessorConfig, Reaper, ReaperConfig,
    StatusReporter,
};
use grok_storage::MentionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Collaborators {
    pub source: Arc<dyn MentionSource>,
    pub context: Option<Arc<dyn ContextFetcher>>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub poster: Arc<dyn ReplyPoster>,
}

pub fn open_store(config: &StorageConfig, max_retries: u32) -> anyhow::Result<MentionStore> {
    if let Some(dir) = config
        .db_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let store = MentionStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    Ok(store.with_max_retries(max_retries))
}

/// Starts the three pipeline loops on the shared store. Each loop registers its
/// own heartbeat with `reporter`.
pub fn spawn_loops(
    config: &Config,
    store: Arc<MentionStore>,
    collaborators: Collaborators,
    reporter: &StatusReporter,
    cancel: &CancellationToken,
) -> JoinSet<Result<(), PipelineError>> {
    // Out-of-range values surface as a store error from the first claim.
    let processing_timeout = chrono::Duration::try_minutes(config.monitor.processing_timeout_minutes)
        .unwrap_or(chrono::Duration::MAX);
    let throttle = Arc::new(PostThrottle::new(Duration::from_secs(
        config.reply.rate_limit_seconds,
    )));
    let mut processor = Processor::new(
        ProcessorConfig {
            batch_size: config.monitor.batch_size,
            claim_window: processing_timeout,
            generation_timeout: Duration::from_secs(config.agent.generation_timeout_seconds),
            policy: MentionPolicy::default(),
        },
        throttle,
    );
    if let Some(fetcher) = collaborators.context {
        processor = processor.with_context_fetcher(fetcher);
    }
    let processor = Arc::new(processor);

    let mut loops = JoinSet::new();
    loops.spawn(run_ingest_loop(
        Ingestor::new(IngestorConfig {
            max_pages: config.monitor.max_pages,
        }),
        store.clone(),
        collaborators.source,
        Duration::from_secs(config.monitor.poll_interval),
        reporter.register("ingestor"),
        cancel.clone(),
    ));
    loops.spawn(run_process_loop(
        processor,
        store.clone(),
        collaborators.generator,
        collaborators.poster,
        Duration::from_secs(config.monitor.processing_interval_seconds),
        reporter.register("processor"),
        cancel.clone(),
    ));
    loops.spawn(run_reaper_loop(
        Reaper::new(ReaperConfig { processing_timeout }),
        store,
        Duration::from_secs(config.monitor.reaper_interval_seconds),
        reporter.register("reaper"),
        cancel.clone(),
    ));
    loops
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        event = "bot_start",
        db = %config.storage.db_path.display(),
        agent = ?config.agent,
        poll_interval = config.monitor.poll_interval
    );

    let credentials = Credentials::load(&config.bilibili.credential_path)?;
    if credentials.is_expired(Utc::now()) {
        warn!(
            event = "credentials_expired",
            expires_at = ?credentials.expires_at,
            "session cookies have expired; mention fetches will fail until they are renewed"
        );
    }

    let batch_seconds = worst_case_batch_seconds(&config);
    let timeout_seconds = u64::try_from(config.monitor.processing_timeout_minutes)
        .unwrap_or(0)
        .saturating_mul(60);
    if batch_seconds >= timeout_seconds {
        warn!(
            event = "batch_may_outlast_claim",
            batch_seconds,
            timeout_seconds,
            "a slow batch can outlive its claims; late mentions are dropped and retried on a later cycle"
        );
    }

    let store = Arc::new(open_store(&config.storage, config.reply.max_retries)?);
    let bilibili = Arc::new(BilibiliClient::new(
        &config.bilibili,
        &credentials,
        config.monitor.batch_size,
    )?);
    let generator = Arc::new(ChatCompletionsGenerator::new(&config.agent)?);

    let cancel = CancellationToken::new();
    let reporter = Arc::new(StatusReporter::new(store.clone(), Utc::now()));
    reporter.register_component("credentials", credentials.expiry_check());
    let mut loops = spawn_loops(
        &config,
        store,
        Collaborators {
            source: bilibili.clone(),
            context: Some(bilibili.clone()),
            generator,
            poster: bilibili,
        },
        &reporter,
        &cancel,
    );

    let health_task = if config.health.enabled {
        let listener = TcpListener::bind((config.health.host.as_str(), config.health.port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind health endpoint on {}:{}",
                    config.health.host, config.health.port
                )
            })?;
        Some(tokio::spawn(health::serve(
            listener,
            reporter.clone(),
            cancel.clone(),
        )))
    } else {
        None
    };

    let mut failures = Vec::new();
    tokio::select! {
        _ = shutdown_signal() => info!(event = "shutdown_signal"),
        Some(joined) = loops.join_next() => {
            if let Err(err) = flatten(joined) {
                failures.push(err);
            }
        }
    }
    cancel.cancel();

    let grace = Duration::from_secs(config.monitor.shutdown_grace_seconds);
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = loops.join_next().await {
            if let Err(err) = flatten(joined) {
                failures.push(err);
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            event = "shutdown_grace_elapsed",
            remaining = loops.len(),
            "abandoning in-flight work; stale claims are reclaimed on the next run"
        );
        loops.abort_all();
    }

    if let Some(task) = health_task {
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(Err(err))) => error!(event = "health_error", error = %err),
            Ok(Err(err)) => error!(event = "health_error", error = %err),
            Ok(Ok(Ok(()))) | Err(_) => {}
        }
    }

    info!(event = "bot_stop", failures = failures.len());
    match failures.into_iter().next() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn flatten(joined: Result<Result<(), PipelineError>, JoinError>) -> Result<(), PipelineError> {
    joined.map_err(PipelineError::from).and_then(|result| result)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(event = "signal_error", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_store_creates_parent_directory_and_applies_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig {
            db_path: dir.path().join("nested").join("grok.db"),
        };
        let store = open_store(&config, 5).expect("store");
        assert_eq!(store.max_retries(), 5);
        assert!(config.db_path.exists());
    }
}
