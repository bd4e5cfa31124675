//! Engine host: one OS thread owning one [`RenderEngine`] instance.
//!
//! ## Why a dedicated thread?
//!
//! Engines wrap C libraries with thread-local state, block for the whole
//! duration of a render, and are not safe to call concurrently. Pinning each
//! instance to its own thread keeps blocking work off the tokio workers and
//! makes the host's job channel the only way in: jobs run strictly one at a
//! time, in arrival order.
//!
//! A host may serve several clients (shared-engine mode). It keeps every
//! client's document bytes and re-opens a client's document when a job from a
//! different client arrives, so the engine only ever has one document open.

use super::{EngineError, EngineFactory, RenderEngine, RenderParams, RenderedPage};
use crate::error::{ErrorKind, RenderError};
use crate::protocol::{DocumentId, RequestId, WorkerId};
use crate::retry::{classify_error, Provenance};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Work an engine can do.
#[derive(Debug, Clone)]
pub(crate) enum EngineOp {
    Open { bytes: Arc<[u8]> },
    Render { page_number: usize, params: RenderParams },
}

#[derive(Debug, Clone)]
pub(crate) enum EngineOutput {
    Opened { total_pages: usize },
    Rendered { page_number: usize, page: RenderedPage },
}

/// Shared abort counter of one worker. Bumping it cancels every job issued
/// before the bump that has not started yet.
#[derive(Debug, Clone, Default)]
pub(crate) struct AbortEpoch(Arc<AtomicU64>);

impl AbortEpoch {
    pub(crate) fn token(&self) -> CancelToken {
        CancelToken {
            epoch: Arc::clone(&self.0),
            issued: self.0.load(Ordering::Acquire),
        }
    }

    pub(crate) fn bump(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CancelToken {
    epoch: Arc<AtomicU64>,
    issued: u64,
}

impl CancelToken {
    fn is_cancelled(&self) -> bool {
        self.epoch.load(Ordering::Acquire) != self.issued
    }
}

#[derive(Debug)]
pub(crate) struct EngineJob {
    pub client: WorkerId,
    pub request_id: RequestId,
    pub document_id: DocumentId,
    pub op: EngineOp,
    pub cancel: CancelToken,
}

/// Result of one job, tagged with everything needed to route it back.
#[derive(Debug)]
pub(crate) struct EngineCompletion {
    pub client: WorkerId,
    pub request_id: RequestId,
    pub document_id: DocumentId,
    pub page_number: Option<usize>,
    pub result: Result<EngineOutput, RenderError>,
}

enum HostCommand {
    Job {
        job: EngineJob,
        done: mpsc::UnboundedSender<EngineCompletion>,
    },
    Release {
        client: WorkerId,
        done: oneshot::Sender<bool>,
    },
}

/// Handle to a running engine thread. Dropping every handle stops the thread
/// after it drains already queued jobs.
#[derive(Debug, Clone)]
pub(crate) struct EngineHost {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<HostCommand>,
}

impl std::fmt::Debug for HostCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostCommand::Job { job, .. } => f.debug_tuple("Job").field(&job.request_id).finish(),
            HostCommand::Release { client, .. } => f.debug_tuple("Release").field(client).finish(),
        }
    }
}

impl EngineHost {
    /// Start the thread and build the engine on it.
    ///
    /// Resolves once the engine exists, or fails with `WorkerInit`.
    pub(crate) async fn spawn(
        name: String,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, RenderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_name = name.clone();

        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_host(factory, rx, ready_tx))
            .map_err(|e| {
                RenderError::new(
                    ErrorKind::WorkerInit,
                    format!("failed to start engine thread: {e}"),
                )
            })?;

        match ready_rx.await {
            Ok(Ok(())) => {
                debug!("Engine host '{}' ready", name);
                Ok(Self {
                    name: name.into(),
                    tx,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RenderError::new(
                ErrorKind::WorkerInit,
                format!("engine thread '{name}' exited during startup"),
            )),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. Its completion is sent on `done`.
    pub(crate) fn submit(
        &self,
        job: EngineJob,
        done: mpsc::UnboundedSender<EngineCompletion>,
    ) -> Result<(), RenderError> {
        self.tx
            .send(HostCommand::Job { job, done })
            .map_err(|_| RenderError::channel_closed("engine host"))
    }

    /// Queue the release of a client's document, after its pending jobs.
    pub(crate) fn release(&self, client: WorkerId) -> Result<oneshot::Receiver<bool>, RenderError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Release { client, done })
            .map_err(|_| RenderError::channel_closed("engine host"))?;
        Ok(rx)
    }
}

fn run_host(
    factory: Arc<dyn EngineFactory>,
    mut rx: mpsc::UnboundedReceiver<HostCommand>,
    ready: oneshot::Sender<Result<(), RenderError>>,
) {
    let mut engine = match catch_unwind(AssertUnwindSafe(|| factory.create())) {
        Ok(Ok(engine)) => {
            let _ = ready.send(Ok(()));
            engine
        }
        Ok(Err(e)) => {
            let _ = ready.send(Err(RenderError::new(
                ErrorKind::WorkerInit,
                format!("failed to initialize engine: {e}"),
            )));
            return;
        }
        Err(_) => {
            let _ = ready.send(Err(RenderError::new(
                ErrorKind::WorkerInit,
                "engine factory panicked",
            )));
            return;
        }
    };

    let mut state = HostState::default();
    while let Some(command) = rx.blocking_recv() {
        match command {
            HostCommand::Job { job, done } => {
                let request_id = job.request_id;
                let completion = state.execute(engine.as_mut(), job);
                if done.send(completion).is_err() {
                    debug!("Completion for {:?} dropped: requester gone", request_id);
                }
            }
            HostCommand::Release { client, done } => {
                let ok = state.release(engine.as_mut(), client);
                let _ = done.send(ok);
            }
        }
    }

    if catch_unwind(AssertUnwindSafe(|| engine.close())).is_err() {
        warn!("Engine panicked while closing");
    }
    info!(
        "Engine host '{}' stopped",
        std::thread::current().name().unwrap_or("?")
    );
}

#[derive(Default)]
struct HostState {
    documents: HashMap<WorkerId, Arc<[u8]>>,
    active: Option<WorkerId>,
}

impl HostState {
    fn execute(&mut self, engine: &mut dyn RenderEngine, job: EngineJob) -> EngineCompletion {
        let page_number = match &job.op {
            EngineOp::Render { page_number, .. } => Some(*page_number),
            EngineOp::Open { .. } => None,
        };

        let result = if job.cancel.is_cancelled() {
            Err(RenderError::aborted("job cancelled before start"))
        } else {
            match job.op {
                EngineOp::Open { bytes } => self.open(engine, job.client, bytes),
                EngineOp::Render {
                    page_number,
                    params,
                } => self.render(engine, job.client, page_number, &params),
            }
        };

        EngineCompletion {
            client: job.client,
            request_id: job.request_id,
            document_id: job.document_id,
            page_number,
            result: result.map_err(|e| match page_number {
                Some(p) => e.for_page(p),
                None => e,
            }),
        }
    }

    fn open(
        &mut self,
        engine: &mut dyn RenderEngine,
        client: WorkerId,
        bytes: Arc<[u8]>,
    ) -> Result<EngineOutput, RenderError> {
        self.documents.remove(&client);
        match guarded(|| engine.open(&bytes)) {
            Ok(total_pages) => {
                self.documents.insert(client, bytes);
                self.active = Some(client);
                Ok(EngineOutput::Opened { total_pages })
            }
            Err(e) => {
                // A failed open leaves the engine without a usable document.
                self.active = None;
                Err(e)
            }
        }
    }

    fn render(
        &mut self,
        engine: &mut dyn RenderEngine,
        client: WorkerId,
        page_number: usize,
        params: &RenderParams,
    ) -> Result<EngineOutput, RenderError> {
        if self.active != Some(client) {
            let Some(bytes) = self.documents.get(&client).cloned() else {
                return Err(RenderError::new(
                    ErrorKind::WorkerInit,
                    format!("no document open for {client}"),
                ));
            };
            debug!("Switching engine document to {}", client);
            self.active = None;
            guarded(|| engine.open(&bytes))?;
            self.active = Some(client);
        }

        let page = guarded(|| engine.render_page(page_number, params))?;
        Ok(EngineOutput::Rendered { page_number, page })
    }

    fn release(&mut self, engine: &mut dyn RenderEngine, client: WorkerId) -> bool {
        self.documents.remove(&client);
        if self.active == Some(client) {
            self.active = None;
            return catch_unwind(AssertUnwindSafe(|| engine.close())).is_ok();
        }
        true
    }
}

/// Run an engine call, turning errors and panics into classified failures.
fn guarded<T>(f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, RenderError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(classify_error(e.message, Provenance::Engine)),
        Err(_) => Err(RenderError::new(
            ErrorKind::PdfPageRender,
            "engine panicked during render call",
        )),
    }
}
