//! Coordinators: one shared engine serving many workers.
//!
//! In shared-engine mode a coordinator owns the only [`EngineHost`] its
//! workers ever reach. Each registered worker gets a private port; the
//! coordinator multiplexes every port into the host's FIFO, so the engine
//! executes one job at a time no matter how many workers are busy.
//! Completions come back to the coordinator, which routes each one to the
//! worker it belongs to, or to the [`RecoveryBus`] when that worker is gone.
//!
//! ```text
//!   worker-1 ─port─┐
//!   worker-2 ─port─┼─▶ coordinator ─▶ EngineHost (one thread, FIFO)
//!   worker-3 ─port─┘        ◀──────── completions
//! ```
//!
//! Control messages:
//!
//! | Message | Reply |
//! |---------|-------|
//! | `InitCoordinator` | `CoordinatorReady` once the engine exists |
//! | `RegisterWorker` | none; the worker's port becomes live |
//! | `Status` | active requests and registered clients |
//! | `Cleanup` | `CleanupClient`, if a reply channel was given |
//! | `Shutdown` | none |

use crate::engine::host::{EngineCompletion, EngineHost, EngineJob};
use crate::engine::EngineFactory;
use crate::error::{ErrorKind, RenderError};
use crate::protocol::{RequestId, WorkerId};
use crate::recovery::{RecoveryBus, RecoveryEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorReady {
    pub coordinator_id: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub coordinator_id: usize,
    pub active_requests: usize,
    /// Registered workers, ascending.
    pub active_clients: Vec<WorkerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupClient {
    pub client_id: Option<WorkerId>,
    pub request_id: Option<RequestId>,
    pub success: bool,
}

pub(crate) enum CoordinatorMessage {
    InitCoordinator {
        reply: oneshot::Sender<Result<CoordinatorReady, RenderError>>,
    },
    RegisterWorker {
        worker_id: WorkerId,
        port: mpsc::UnboundedReceiver<EngineJob>,
        replies: mpsc::UnboundedSender<EngineCompletion>,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Cleanup {
        client_id: Option<WorkerId>,
        request_id: Option<RequestId>,
        reply: Option<oneshot::Sender<CleanupClient>>,
    },
    Shutdown,
}

/// Handle to a coordinator task.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    index: usize,
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    /// Start coordinator `index`. Its engine is built by [`Self::init`].
    pub(crate) fn spawn(index: usize, factory: Arc<dyn EngineFactory>, bus: RecoveryBus) -> Self {
        let (tx, control) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            index,
            factory,
            bus,
            control,
            host: None,
            ports: StreamMap::new(),
            clients: HashMap::new(),
            done_tx,
            done_rx,
            active_requests: 0,
        };
        tokio::spawn(coordinator.run());
        Self::from_sender(index, tx)
    }

    pub(crate) fn from_sender(index: usize, tx: mpsc::UnboundedSender<CoordinatorMessage>) -> Self {
        Self { index, tx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn send(&self, message: CoordinatorMessage) -> Result<(), RenderError> {
        self.tx
            .send(message)
            .map_err(|_| RenderError::channel_closed("coordinator"))
    }

    pub async fn init(&self) -> Result<CoordinatorReady, RenderError> {
        let (reply, rx) = oneshot::channel();
        self.send(CoordinatorMessage::InitCoordinator { reply })?;
        rx.await
            .map_err(|_| RenderError::channel_closed("coordinator reply"))?
    }

    pub(crate) fn register_worker(
        &self,
        worker_id: WorkerId,
        port: mpsc::UnboundedReceiver<EngineJob>,
        replies: mpsc::UnboundedSender<EngineCompletion>,
    ) -> Result<(), RenderError> {
        self.send(CoordinatorMessage::RegisterWorker {
            worker_id,
            port,
            replies,
        })
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, RenderError> {
        let (reply, rx) = oneshot::channel();
        self.send(CoordinatorMessage::Status { reply })?;
        rx.await
            .map_err(|_| RenderError::channel_closed("coordinator reply"))
    }

    /// Release engine-side state of one client, or of every client when
    /// `client_id` is `None`.
    pub async fn cleanup(
        &self,
        client_id: Option<WorkerId>,
        request_id: Option<RequestId>,
    ) -> Result<CleanupClient, RenderError> {
        let (reply, rx) = oneshot::channel();
        self.send(CoordinatorMessage::Cleanup {
            client_id,
            request_id,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| {
            RenderError::new(
                ErrorKind::WorkerCleanup,
                format!("coordinator {} dropped a cleanup request", self.index),
            )
        })
    }

    /// Fire-and-forget cleanup, used by terminating workers.
    pub(crate) fn cleanup_detached(&self, client_id: WorkerId) {
        let _ = self.send(CoordinatorMessage::Cleanup {
            client_id: Some(client_id),
            request_id: None,
            reply: None,
        });
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.send(CoordinatorMessage::Shutdown);
    }
}

struct Coordinator {
    index: usize,
    factory: Arc<dyn EngineFactory>,
    bus: RecoveryBus,
    control: mpsc::UnboundedReceiver<CoordinatorMessage>,
    host: Option<EngineHost>,
    ports: StreamMap<WorkerId, UnboundedReceiverStream<EngineJob>>,
    clients: HashMap<WorkerId, mpsc::UnboundedSender<EngineCompletion>>,
    done_tx: mpsc::UnboundedSender<EngineCompletion>,
    done_rx: mpsc::UnboundedReceiver<EngineCompletion>,
    active_requests: usize,
}

impl Coordinator {
    async fn run(mut self) {
        debug!("Coordinator {} started", self.index);
        loop {
            tokio::select! {
                message = self.control.recv() => match message {
                    Some(CoordinatorMessage::Shutdown) | None => break,
                    Some(message) => self.handle_control(message).await,
                },
                Some((client, job)) = self.ports.next(), if !self.ports.is_empty() => {
                    self.forward(client, job);
                }
                Some(done) = self.done_rx.recv() => self.route(done),
            }
        }
        info!(
            "Coordinator {} stopped ({} clients registered)",
            self.index,
            self.clients.len()
        );
    }

    async fn handle_control(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::InitCoordinator { reply } => {
                let result = self.init().await;
                let _ = reply.send(result);
            }
            CoordinatorMessage::RegisterWorker {
                worker_id,
                port,
                replies,
            } => {
                debug!("Coordinator {}: registered {}", self.index, worker_id);
                self.ports
                    .insert(worker_id, UnboundedReceiverStream::new(port));
                self.clients.insert(worker_id, replies);
            }
            CoordinatorMessage::Status { reply } => {
                self.clients.retain(|_, tx| !tx.is_closed());
                let mut active_clients: Vec<WorkerId> = self.clients.keys().copied().collect();
                active_clients.sort_unstable();
                let _ = reply.send(CoordinatorStatus {
                    coordinator_id: self.index,
                    active_requests: self.active_requests,
                    active_clients,
                });
            }
            CoordinatorMessage::Cleanup {
                client_id,
                request_id,
                reply,
            } => self.cleanup(client_id, request_id, reply),
            CoordinatorMessage::Shutdown => {}
        }
    }

    async fn init(&mut self) -> Result<CoordinatorReady, RenderError> {
        if self.host.is_none() {
            let host = EngineHost::spawn(
                format!("pdf-coordinator-{}", self.index),
                Arc::clone(&self.factory),
            )
            .await?;
            info!("Coordinator {} engine ready", self.index);
            self.host = Some(host);
        }
        Ok(CoordinatorReady {
            coordinator_id: self.index,
        })
    }

    fn forward(&mut self, client: WorkerId, mut job: EngineJob) {
        job.client = client;
        // Every forwarded job is counted once here and released once in `route`.
        self.active_requests += 1;
        let Some(host) = &self.host else {
            let message = format!("coordinator {} is not initialized", self.index);
            self.route(EngineCompletion {
                client,
                request_id: job.request_id,
                document_id: job.document_id,
                page_number: None,
                result: Err(RenderError::new(ErrorKind::WorkerInit, message)),
            });
            return;
        };

        let request_id = job.request_id;
        let document_id = job.document_id;
        if let Err(e) = host.submit(job, self.done_tx.clone()) {
            self.route(EngineCompletion {
                client,
                request_id,
                document_id,
                page_number: None,
                result: Err(e),
            });
        }
    }

    fn route(&mut self, done: EngineCompletion) {
        self.active_requests = self.active_requests.saturating_sub(1);
        let client = done.client;
        let undelivered = match self.clients.get(&client) {
            Some(tx) => tx.send(done).err().map(|e| e.0),
            None => Some(done),
        };
        if let Some(done) = undelivered {
            warn!(
                "Coordinator {}: {} is gone, publishing {:?} for recovery",
                self.index, client, done.request_id
            );
            self.clients.remove(&client);
            self.bus.publish(RecoveryEvent::from_completion(done));
        }
    }

    fn cleanup(
        &mut self,
        client_id: Option<WorkerId>,
        request_id: Option<RequestId>,
        reply: Option<oneshot::Sender<CleanupClient>>,
    ) {
        let targets: Vec<WorkerId> = match client_id {
            Some(id) => vec![id],
            None => self.clients.keys().copied().collect(),
        };
        for id in &targets {
            if self.clients.get(id).is_some_and(|tx| tx.is_closed()) {
                self.clients.remove(id);
            }
        }

        let mut releases = Vec::with_capacity(targets.len());
        let mut success = true;
        if let Some(host) = &self.host {
            for id in targets {
                match host.release(id) {
                    Ok(rx) => releases.push(rx),
                    Err(_) => success = false,
                }
            }
        }

        let index = self.index;
        let bus = self.bus.clone();
        // Releases queue behind the client's pending jobs; wait off the loop.
        tokio::spawn(async move {
            for rx in releases {
                success &= rx.await.unwrap_or(false);
            }
            debug!(
                "Coordinator {} cleanup of {:?}: success={}",
                index, client_id, success
            );
            let result = CleanupClient {
                client_id,
                request_id,
                success,
            };
            if let Some(reply) = reply {
                if reply.send(result).is_err() {
                    bus.publish(RecoveryEvent::Cleanup {
                        client_id,
                        request_id,
                        success,
                    });
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::host::{AbortEpoch, EngineOp, EngineOutput};
    use crate::protocol::DocumentId;
    use crate::testing::{pdf_bytes, EngineScript};
    use std::time::Duration;

    async fn started(script: EngineScript) -> (CoordinatorHandle, Arc<crate::testing::EngineProbe>) {
        let (factory, probe) = script.into_factory();
        let handle = CoordinatorHandle::spawn(0, factory, RecoveryBus::default());
        let ready = handle.init().await.unwrap();
        assert_eq!(ready.coordinator_id, 0);
        (handle, probe)
    }

    fn register(
        handle: &CoordinatorHandle,
        id: u64,
    ) -> (
        mpsc::UnboundedSender<EngineJob>,
        mpsc::UnboundedReceiver<EngineCompletion>,
    ) {
        let (port_tx, port_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        handle.register_worker(WorkerId(id), port_rx, done_tx).unwrap();
        (port_tx, done_rx)
    }

    fn open_job(client: u64, epoch: &AbortEpoch) -> EngineJob {
        EngineJob {
            client: WorkerId(client),
            request_id: RequestId(client),
            document_id: DocumentId(client),
            op: EngineOp::Open {
                bytes: pdf_bytes(client as usize + 1).into(),
            },
            cancel: epoch.token(),
        }
    }

    #[tokio::test]
    async fn completions_are_routed_to_their_worker() {
        let (handle, probe) = started(EngineScript::new(1)).await;
        let (port_a, mut done_a) = register(&handle, 1);
        let (port_b, mut done_b) = register(&handle, 2);
        let epoch = AbortEpoch::default();

        port_a.send(open_job(1, &epoch)).unwrap();
        port_b.send(open_job(2, &epoch)).unwrap();

        let a = tokio::time::timeout(Duration::from_secs(5), done_a.recv()).await.unwrap().unwrap();
        let b = tokio::time::timeout(Duration::from_secs(5), done_b.recv()).await.unwrap().unwrap();
        assert!(matches!(a.result, Ok(EngineOutput::Opened { total_pages: 2 })));
        assert!(matches!(b.result, Ok(EngineOutput::Opened { total_pages: 3 })));
        assert_eq!(probe.created(), 1);

        let status = handle.status().await.unwrap();
        assert_eq!(status.active_clients, vec![WorkerId(1), WorkerId(2)]);
        assert_eq!(status.active_requests, 0);
    }

    #[tokio::test]
    async fn cleanup_releases_client_document() {
        let (handle, probe) = started(EngineScript::new(1)).await;
        let (port, mut done) = register(&handle, 5);
        let epoch = AbortEpoch::default();
        port.send(open_job(5, &epoch)).unwrap();
        done.recv().await.unwrap();

        let result = handle.cleanup(Some(WorkerId(5)), Some(RequestId(77))).await.unwrap();
        assert_eq!(
            result,
            CleanupClient {
                client_id: Some(WorkerId(5)),
                request_id: Some(RequestId(77)),
                success: true,
            }
        );
        assert_eq!(probe.closes(), 1);
    }

    #[tokio::test]
    async fn completion_for_departed_worker_is_recovered() {
        let (factory, _probe) = EngineScript::new(1).into_factory();
        let bus = RecoveryBus::default();
        let handle = CoordinatorHandle::spawn(0, factory, bus.clone());
        handle.init().await.unwrap();

        let (port, done) = register(&handle, 8);
        drop(done);
        port.send(open_job(8, &AbortEpoch::default())).unwrap();

        let mut events = bus.subscribe_stream(crate::recovery::EventKind::PdfInitialized);
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            RecoveryEvent::PdfInitialized { document_id: DocumentId(8), .. }
        ));
    }

    #[tokio::test]
    async fn load_counts_exactly_the_jobs_in_flight() {
        let (factory, probe) = EngineScript::new(2).into_factory();
        let handle = CoordinatorHandle::spawn(0, factory, RecoveryBus::default());
        let (port, mut done) = register(&handle, 4);
        let epoch = AbortEpoch::default();

        // Before init every job is rejected without touching the count.
        port.send(open_job(4, &epoch)).unwrap();
        let rejected = done.recv().await.unwrap();
        assert_eq!(rejected.result.unwrap_err().kind, ErrorKind::WorkerInit);
        assert_eq!(handle.status().await.unwrap().active_requests, 0);

        handle.init().await.unwrap();
        port.send(open_job(4, &epoch)).unwrap();
        done.recv().await.unwrap().result.unwrap();

        probe.gate().close();
        port.send(EngineJob {
            client: WorkerId(4),
            request_id: RequestId(10),
            document_id: DocumentId(4),
            op: EngineOp::Render {
                page_number: 1,
                params: crate::engine::RenderParams {
                    scale: 1.0,
                    quality: 90,
                    max_dimension: 100,
                },
            },
            cancel: epoch.token(),
        })
        .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while handle.status().await.unwrap().active_requests != 1 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        probe.gate().open();
        done.recv().await.unwrap().result.unwrap();
        assert_eq!(handle.status().await.unwrap().active_requests, 0);
    }

    #[tokio::test]
    async fn factory_failure_fails_init() {
        let (factory, _probe) = EngineScript::new(1).fail_create("library missing").into_factory();
        let handle = CoordinatorHandle::spawn(3, factory, RecoveryBus::default());
        let err = handle.init().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkerInit);
    }
}
