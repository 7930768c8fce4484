// Background ingestion
// One dedicated thread drains a FIFO queue of ingest jobs so callers never block on
// chunking, embedding or indexing


use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{IngestProgress, RetrievalPipeline, SKIPPED_DOCUMENT_MESSAGE};
use crate::documents::DocumentSource;
use crate::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Progress of one job, delivered in order to the worker's callback on the worker thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    /// The worker picked the job off the queue
    Queued {
        job: JobId,
        conversation_id: String,
        source_id: String,
    },
    Chunked {
        job: JobId,
        chunks: usize,
    },
    Embedded {
        job: JobId,
        vectors: usize,
    },
    Indexed {
        job: JobId,
        document_id: String,
        chunks: usize,
    },
    /// The document was not stored: some embeddings were fallback vectors, or the
    /// embedding service rejected the key or endpoint
    Skipped {
        job: JobId,
        reason: String,
    },
    Failed {
        job: JobId,
        error: String,
    },
}

impl IngestEvent {
    #[inline]
    pub fn job(&self) -> JobId {
        match self {
            Self::Queued { job, .. }
            | Self::Chunked { job, .. }
            | Self::Embedded { job, .. }
            | Self::Indexed { job, .. }
            | Self::Skipped { job, .. }
            | Self::Failed { job, .. } => *job,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Indexed { .. } | Self::Skipped { .. } | Self::Failed { .. }
        )
    }
}

/// Final state of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Indexed { document_id: String, chunks: usize },
    Skipped { reason: String },
    Failed { error: String },
}

type EventCallback = Box<dyn Fn(&IngestEvent) + Send + Sync>;

struct Job {
    id: JobId,
    conversation_id: String,
    source: DocumentSource,
    done: oneshot::Sender<IngestOutcome>,
}

/// Receipt for a submitted job
#[derive(Debug)]
pub struct IngestHandle {
    pub job_id: JobId,
    outcome: oneshot::Receiver<IngestOutcome>,
}

impl IngestHandle {
    /// Block until the job finishes; must not be called from an async context
    #[inline]
    pub fn wait(self) -> IngestOutcome {
        self.outcome.blocking_recv().unwrap_or_else(|_| abandoned())
    }

    #[inline]
    pub async fn outcome(self) -> IngestOutcome {
        self.outcome.await.unwrap_or_else(|_| abandoned())
    }
}

fn abandoned() -> IngestOutcome {
    IngestOutcome::Failed {
        error: "ingest worker stopped before finishing the job".to_string(),
    }
}

/// Single-thread FIFO ingestion queue in front of a [`RetrievalPipeline`]
///
/// Dropping the worker closes the queue, lets already-queued jobs finish and
/// joins the thread.
pub struct IngestWorker {
    sender: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for IngestWorker {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestWorker")
            .field("running", &self.sender.is_some())
            .finish_non_exhaustive()
    }
}

impl IngestWorker {
    /// Start the worker thread; `on_event` is called for every job milestone
    #[inline]
    pub fn spawn<F>(pipeline: Arc<RetrievalPipeline>, on_event: F) -> Result<Self>
    where
        F: Fn(&IngestEvent) + Send + Sync + 'static,
    {
        let on_event: EventCallback = Box::new(on_event);
        let (sender, receiver) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name("ingest-worker".to_string())
            .spawn(move || run(&pipeline, receiver, &on_event))?;

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    /// Queue `source` for ingestion into `conversation_id` and return immediately
    #[inline]
    pub fn submit(&self, conversation_id: &str, source: DocumentSource) -> Result<IngestHandle> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RagError::InvalidRequest("ingest worker is shut down".to_string()))?;

        let id = JobId::new();
        let (done, outcome) = oneshot::channel();
        sender
            .send(Job {
                id,
                conversation_id: conversation_id.to_string(),
                source,
                done,
            })
            .map_err(|_| RagError::InvalidRequest("ingest worker has stopped".to_string()))?;

        debug!("Queued ingest job {} for {}", id, conversation_id);
        Ok(IngestHandle { job_id: id, outcome })
    }

    /// Stop accepting jobs, finish the queued ones and join the thread
    #[inline]
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.sender.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Ingest worker thread panicked");
            }
        }
    }
}

impl Drop for IngestWorker {
    #[inline]
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    pipeline: &RetrievalPipeline,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    on_event: &EventCallback,
) {
    info!("Ingest worker started");
    while let Some(job) = receiver.blocking_recv() {
        let outcome = process(pipeline, &job, on_event);
        // The caller may have dropped its handle
        let _ = job.done.send(outcome);
    }
    info!("Ingest worker stopped");
}

fn process(pipeline: &RetrievalPipeline, job: &Job, on_event: &EventCallback) -> IngestOutcome {
    debug!("Processing ingest job {}", job.id);
    on_event(&IngestEvent::Queued {
        job: job.id,
        conversation_id: job.conversation_id.clone(),
        source_id: job.source.source_id(),
    });

    let mut observer = |progress: IngestProgress| {
        let event = match progress {
            IngestProgress::Chunked { chunks } => IngestEvent::Chunked { job: job.id, chunks },
            IngestProgress::Embedded { vectors } => IngestEvent::Embedded {
                job: job.id,
                vectors,
            },
        };
        on_event(&event);
    };

    let (event, outcome) =
        match pipeline.ingest_observed(&job.conversation_id, &job.source, &mut observer) {
            Ok(report) => (
                IngestEvent::Indexed {
                    job: job.id,
                    document_id: report.document_id.clone(),
                    chunks: report.chunk_ids.len(),
                },
                IngestOutcome::Indexed {
                    document_id: report.document_id,
                    chunks: report.chunk_ids.len(),
                },
            ),
            Err(RagError::EmbeddingDegraded(reason)) => {
                warn!("Ingest job {} skipped: {}", job.id, reason);
                (
                    IngestEvent::Skipped {
                        job: job.id,
                        reason: reason.clone(),
                    },
                    IngestOutcome::Skipped { reason },
                )
            }
            Err(e @ (RagError::Auth(_) | RagError::NotFound(_))) => {
                warn!("Ingest job {} skipped: {}", job.id, e);
                let reason = format!("{SKIPPED_DOCUMENT_MESSAGE} ({e})");
                (
                    IngestEvent::Skipped {
                        job: job.id,
                        reason: reason.clone(),
                    },
                    IngestOutcome::Skipped { reason },
                )
            }
            Err(e) => {
                error!("Ingest job {} failed: {}", job.id, e);
                let error = e.to_string();
                (
                    IngestEvent::Failed {
                        job: job.id,
                        error: error.clone(),
                    },
                    IngestOutcome::Failed { error },
                )
            }
        };

    on_event(&event);
    outcome
}
