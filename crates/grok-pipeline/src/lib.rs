use grok_storage::StorageError;
use thiserror::Error;

mod ingestor;
mod policy;
mod processor;
mod reaper;
mod runtime;
mod status;
mod throttle;

pub use ingestor::{IngestTickReport, Ingestor, IngestorConfig};
pub use policy::{MentionPolicy, PolicyDecision, DEFAULT_ALLOWED_KINDS};
pub use processor::{ProcessTickReport, Processor, ProcessorConfig};
pub use reaper::{Reaper, ReaperConfig, ReaperTickReport};
pub use runtime::{run_ingest_loop, run_process_loop, run_reaper_loop};
pub use status::{
    ComponentCheck, ComponentStatus, LoopHeartbeat, LoopState, LoopStatus, StatusReporter,
    StatusSnapshot,
};
pub use throttle::{PostThrottle, ThrottlePermit};

/// Errors that stop a pipeline loop. Collaborator failures never surface here;
/// they are recorded on the mention they belong to.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("loop task ended abnormally: {0}")]
    Join(#[from] tokio::task::JoinError),
}
